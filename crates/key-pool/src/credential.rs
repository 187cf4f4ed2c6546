//! Opaque upstream credential
//!
//! Raw API keys must never reach logs. `Credential` formats as the first few
//! characters followed by `...`, which is enough for an operator to tell keys
//! apart. Use `expose()` only when building the upstream request.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Characters of the raw key shown in logs.
const VISIBLE_PREFIX: usize = 8;

/// An upstream API key. Cheap to clone; compares by raw value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    /// Raw key for the upstream request header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Prefix-only rendering for logs and diagnostics.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Credential::new(raw.trim()))
    }
}

/// Parse a comma-separated key list, trimming whitespace, dropping empty
/// entries and duplicates while keeping first-seen order.
pub fn parse_key_list(raw: &str) -> Vec<Credential> {
    let mut keys: Vec<Credential> = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = Credential::new(trimmed);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
