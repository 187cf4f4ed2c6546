//! Persisted key settings
//!
//! Manages a JSON file holding the configured API keys and the set of keys
//! known to be invalid, so later startups skip re-probing them. All writes
//! use atomic temp-file + rename to prevent corruption on crash, and a tokio
//! Mutex serializes writers (startup reconciliation, background health
//! checking, request-path quarantines, admin actions).
//!
//! Every mutating method persists only when the stored state actually
//! changed, and reports whether it did.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// On-disk settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedKeys {
    /// Configured keys, in the order operators added them
    #[serde(default)]
    pub api_keys: Vec<Credential>,
    /// Keys known invalid, sorted and de-duplicated
    #[serde(default)]
    pub invalid_api_keys: BTreeSet<Credential>,
}

/// Thread-safe settings file manager.
pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<PersistedKeys>,
}

impl SettingsStore {
    /// Load settings from the given file path.
    ///
    /// If the file doesn't exist, creates it empty (cold start with zero keys;
    /// keys can still arrive via `GEMINI_API_KEYS`).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Persistence(format!("reading settings file: {e}")))?;
            let mut keys: PersistedKeys = serde_json::from_str(&contents)
                .map_err(|e| Error::SettingsParse(format!("parsing settings file: {e}")))?;
            let before = keys.api_keys.len() + keys.invalid_api_keys.len();
            keys.api_keys.retain(|key| !key.expose().is_empty());
            keys.invalid_api_keys.retain(|key| !key.expose().is_empty());
            let blank = before - keys.api_keys.len() - keys.invalid_api_keys.len();
            if blank > 0 {
                warn!(path = %path.display(), blank, "ignoring blank keys in settings file");
            }
            info!(
                path = %path.display(),
                keys = keys.api_keys.len(),
                invalid = keys.invalid_api_keys.len(),
                "loaded key settings"
            );
            keys
        } else {
            info!(path = %path.display(), "settings file not found, starting empty");
            let keys = PersistedKeys::default();
            write_atomic(&path, &keys).await?;
            keys
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the whole persisted document.
    pub async fn current(&self) -> PersistedKeys {
        self.state.lock().await.clone()
    }

    /// Configured keys in insertion order.
    pub async fn configured_keys(&self) -> Vec<Credential> {
        self.state.lock().await.api_keys.clone()
    }

    /// Keys known invalid.
    pub async fn invalid_keys(&self) -> BTreeSet<Credential> {
        self.state.lock().await.invalid_api_keys.clone()
    }

    /// Comma-joined raw invalid keys, sorted.
    pub async fn invalid_keys_csv(&self) -> String {
        let state = self.state.lock().await;
        state
            .invalid_api_keys
            .iter()
            .map(Credential::expose)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Add keys to the configured set. Persists only on change.
    pub async fn register_keys(
        &self,
        keys: impl IntoIterator<Item = Credential>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for key in keys {
            if !state.api_keys.contains(&key) {
                state.api_keys.push(key);
                changed = true;
            }
        }
        if changed {
            debug!(keys = state.api_keys.len(), "registered configured keys");
            write_atomic(&self.path, &state).await?;
        }
        Ok(changed)
    }

    /// Union keys into the invalid set. Persists only on change.
    pub async fn merge_invalid(
        &self,
        keys: impl IntoIterator<Item = Credential>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.invalid_api_keys.len();
        state.invalid_api_keys.extend(keys);
        if state.invalid_api_keys.len() == before {
            return Ok(false);
        }
        debug!(invalid = state.invalid_api_keys.len(), "merged invalid keys");
        write_atomic(&self.path, &state).await?;
        Ok(true)
    }

    /// Remove keys from the invalid set. Persists only on change.
    pub async fn clear_invalid(
        &self,
        keys: impl IntoIterator<Item = Credential>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for key in keys {
            changed |= state.invalid_api_keys.remove(&key);
        }
        if changed {
            debug!(invalid = state.invalid_api_keys.len(), "cleared revalidated keys");
            write_atomic(&self.path, &state).await?;
        }
        Ok(changed)
    }
}

/// Write settings to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file holds API keys.
async fn write_atomic(path: &Path, data: &PersistedKeys) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Persistence(format!("serializing settings: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".settings.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Persistence(format!("writing temp settings file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Persistence(format!("setting settings file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Persistence(format!("renaming temp settings file: {e}")))?;

    debug!(path = %path.display(), "persisted key settings");
    Ok(())
}
