//! Response cache keyed by request fingerprint
//!
//! Entries expire once they are older than the configured expiry. An expired
//! entry is never returned: `get` purges it on sight, and `sweep_expired`
//! removes the rest periodically. When an insert would exceed the entry limit, the single
//! oldest entry by creation time is evicted first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// Top-level body fields that never change the upstream answer.
const VOLATILE_FIELDS: &[&str] = &["request_id", "id", "user", "stream"];

/// Deterministic digest of the semantically relevant parts of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a call to `operation` (method and upstream path, e.g.
    /// `POST /v1beta/models/gemini-pro:generateContent`) on `model` with the
    /// given JSON body.
    ///
    /// The whole body contributes except `VOLATILE_FIELDS`. serde_json objects
    /// iterate in key order, so client key ordering does not change the digest.
    pub fn for_request(operation: &str, model: &str, body: &Value) -> Self {
        let body = match body {
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .filter(|(name, _)| !VOLATILE_FIELDS.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<Map<String, Value>>(),
            ),
            other => other.clone(),
        };
        let mut relevant = Map::new();
        relevant.insert("operation".into(), Value::String(operation.to_string()));
        relevant.insert("model".into(), Value::String(model.to_string()));
        relevant.insert("body".into(), body);
        Self::from_bytes(Value::Object(relevant).to_string().as_bytes())
    }

    /// SHA-256 of arbitrary bytes, URL-safe base64 without padding.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry<V> {
    payload: V,
    created_at: Instant,
}

/// Bounded, expiring response store.
pub struct ResponseCache<V> {
    entries: Mutex<HashMap<Fingerprint, Entry<V>>>,
    expiry: Duration,
    max_entries: usize,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(expiry: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry,
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) > self.expiry
    }

    /// Stored payload for `fingerprint`, if present and not expired.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        let lookup = entries
            .get(fingerprint)
            .map(|entry| (!self.is_expired(entry, now)).then(|| entry.payload.clone()));
        match lookup {
            Some(Some(payload)) => {
                metrics::counter!("response_cache_hits_total").increment(1);
                return Some(payload);
            }
            Some(None) => {
                entries.remove(fingerprint);
                metrics::counter!("response_cache_evictions_total", "reason" => "expired")
                    .increment(1);
            }
            None => {}
        }
        metrics::counter!("response_cache_misses_total").increment(1);
        None
    }

    /// Insert or overwrite. Inserting a new fingerprint into a full cache
    /// evicts the oldest entry first.
    pub fn put(&self, fingerprint: Fingerprint, payload: V) {
        let mut entries = self.lock();
        if !entries.contains_key(&fingerprint) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(fp, _)| fp.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                metrics::counter!("response_cache_evictions_total", "reason" => "capacity")
                    .increment(1);
                debug!(fingerprint = %oldest, "evicted oldest cache entry");
            }
        }
        entries.insert(
            fingerprint,
            Entry {
                payload,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - entries.len();
        if removed > 0 {
            metrics::counter!("response_cache_evictions_total", "reason" => "expired")
                .increment(removed as u64);
            debug!(removed, remaining = entries.len(), "swept expired cache entries");
        }
        removed
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Physical entry count, including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }
}
