//! Active credential list and round-robin rotation
//!
//! The pool owns the ordered list of known-good credentials and a rotation
//! sequence derived from it. Every membership change bumps a version counter;
//! `allocate` notices the version change and rebuilds the rotation before
//! handing out the next key. Within one version, keys are offered strictly
//! cyclically, so any run of `len()` consecutive allocations returns every
//! active key exactly once.
//!
//! All operations are synchronous and never perform I/O. The pool does not
//! persist anything; callers record quarantined keys in `SettingsStore`.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Rotation sequence built from one version of the active list.
#[derive(Debug, Default)]
struct Rotation {
    keys: Vec<Credential>,
    cursor: usize,
    version: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    active: Vec<Credential>,
    version: u64,
    rotation: Rotation,
}

impl PoolState {
    /// Rebuild the rotation from the active list, resuming at the first key
    /// that was still due in the old rotation and survived the change.
    fn rebuild_rotation(&mut self) {
        let old = std::mem::take(&mut self.rotation);
        let resume = old
            .keys
            .iter()
            .skip(old.cursor)
            .find_map(|due| self.active.iter().position(|k| k == due))
            .unwrap_or(0);
        self.rotation = Rotation {
            keys: self.active.clone(),
            cursor: resume,
            version: self.version,
        };
    }

    fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
        metrics::gauge!("keypool_active_credentials").set(self.active.len() as f64);
    }
}

/// Point-in-time view of the pool for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub active: Vec<Credential>,
    pub version: u64,
}

/// Round-robin pool of active credentials.
///
/// A single `Mutex` guards the active list and the rotation together so an
/// allocation can never observe a rotation built from a different list.
#[derive(Debug, Default)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Create a pool with the given active credentials (duplicates dropped).
    pub fn new(initial: Vec<Credential>) -> Self {
        let mut active: Vec<Credential> = Vec::with_capacity(initial.len());
        for key in initial {
            if !active.contains(&key) {
                active.push(key);
            }
        }
        info!(keys = active.len(), "credential pool initialized");
        let mut state = PoolState {
            active,
            ..PoolState::default()
        };
        state.bump_version();
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the next credential in rotation.
    ///
    /// Rebuilds the rotation if the active list changed since it was built,
    /// and restarts it from the current active list once exhausted.
    /// Fails with `EmptyPool` when no credential is active.
    pub fn allocate(&self) -> Result<Credential> {
        let mut state = self.lock();
        if state.active.is_empty() {
            metrics::counter!("keypool_allocation_failures_total").increment(1);
            return Err(Error::EmptyPool);
        }

        if state.rotation.version != state.version {
            debug!(version = state.version, "active list changed, rebuilding rotation");
            state.rebuild_rotation();
        }
        if state.rotation.cursor >= state.rotation.keys.len() {
            state.rotation.keys = state.active.clone();
            state.rotation.cursor = 0;
        }

        let rotation = &mut state.rotation;
        let key = rotation.keys[rotation.cursor].clone();
        rotation.cursor += 1;
        Ok(key)
    }

    /// Remove a credential from the active list and rotation.
    ///
    /// Idempotent; returns whether the credential was active.
    pub fn quarantine(&self, key: &Credential) -> bool {
        let mut state = self.lock();
        let before = state.active.len();
        state.active.retain(|k| k != key);
        if state.active.len() == before {
            debug!(key = %key, "quarantine requested for inactive key");
            return false;
        }
        state.bump_version();
        metrics::counter!("keypool_quarantined_total").increment(1);
        warn!(key = %key, remaining = state.active.len(), "key quarantined");
        true
    }

    /// Add a credential to the active list if absent.
    ///
    /// Returns whether the credential was newly added.
    pub fn admit(&self, key: Credential) -> bool {
        let mut state = self.lock();
        if state.active.contains(&key) {
            return false;
        }
        info!(key = %key, "key admitted to pool");
        state.active.push(key);
        state.bump_version();
        true
    }

    /// Ordered copy of the active list.
    pub fn snapshot(&self) -> Vec<Credential> {
        self.lock().active.clone()
    }

    /// Active list together with its version.
    pub fn status(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            active: state.active.clone(),
            version: state.version,
        }
    }

    pub fn contains(&self, key: &Credential) -> bool {
        self.lock().active.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pool health summary for the health and admin endpoints.
    pub fn health(&self) -> serde_json::Value {
        let snapshot = self.status();
        let status = if snapshot.active.is_empty() {
            "unhealthy"
        } else {
            "healthy"
        };
        let keys: Vec<String> = snapshot.active.iter().map(Credential::masked).collect();
        serde_json::json!({
            "status": status,
            "keys_active": snapshot.active.len(),
            "rotation_version": snapshot.version,
            "keys": keys,
        })
    }
}
