//! Credential health checking
//!
//! Validates credentials against the upstream service through a `Probe`.
//! Two passes exist: a blocking "find one usable key" pass used at startup so
//! serving can begin immediately, and a paced sequential pass that validates
//! everything else in the background. Results flow into the pool (admit on
//! success, quarantine on failure) and, once a pass finishes, into the
//! persisted invalid set.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use upstream::Probe;

use crate::credential::Credential;
use crate::pool::CredentialPool;
use crate::store::SettingsStore;

/// Pause between probes in the sequential passes, to stay under upstream
/// throttling.
pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(50);

/// Outcome of `find_first_valid`.
#[derive(Debug, Default)]
pub struct FirstValid {
    /// First credential that passed, if any
    pub found: Option<Credential>,
    /// Candidates after the one found, not yet probed
    pub remaining: Vec<Credential>,
    /// Candidates probed and rejected before the first success
    pub invalid: Vec<Credential>,
}

/// Outcome of a sequential probe pass.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    /// Credentials that passed and were newly admitted
    pub admitted: Vec<Credential>,
    /// Credentials that failed in this pass
    pub invalid: Vec<Credential>,
    /// Whether the settings file was rewritten at the end of the pass
    pub persisted: bool,
}

/// Validates credentials and feeds the results into the pool and settings.
pub struct HealthChecker {
    pool: Arc<CredentialPool>,
    probe: Arc<dyn Probe>,
    store: Arc<SettingsStore>,
    probe_delay: Duration,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<CredentialPool>,
        probe: Arc<dyn Probe>,
        store: Arc<SettingsStore>,
        probe_delay: Duration,
    ) -> Self {
        Self {
            pool,
            probe,
            store,
            probe_delay,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    /// Probe a single credential. Fail-closed: network errors count as invalid.
    pub async fn probe_one(&self, key: &Credential) -> bool {
        self.probe.check(key.expose()).await
    }

    /// Probe candidates in order until one passes.
    ///
    /// Returns as soon as a credential passes; the unprobed tail is handed
    /// back so the caller can validate it in the background. Does not touch
    /// the pool.
    pub async fn find_first_valid(&self, candidates: Vec<Credential>) -> FirstValid {
        let mut invalid = Vec::new();
        let mut iter = candidates.into_iter();

        while let Some(key) = iter.next() {
            if self.probe_one(&key).await {
                info!(key = %key, probe = self.probe.id(), "found first valid key");
                return FirstValid {
                    found: Some(key),
                    remaining: iter.collect(),
                    invalid,
                };
            }
            warn!(key = %key, "key failed validation");
            invalid.push(key);
        }

        FirstValid {
            found: None,
            remaining: Vec::new(),
            invalid,
        }
    }

    /// Probe candidates sequentially with pacing, admitting the ones that pass.
    ///
    /// Failures are quarantined. When the pass ends, `already_invalid` and
    /// this pass's failures are merged into the persisted invalid set, which
    /// is only rewritten if it changed.
    pub async fn probe_batch(
        &self,
        candidates: Vec<Credential>,
        already_invalid: Vec<Credential>,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for key in candidates {
            if self.probe_one(&key).await {
                info!(key = %key, "key valid");
                if self.pool.admit(key.clone()) {
                    report.admitted.push(key);
                }
            } else {
                warn!(key = %key, "key invalid");
                self.pool.quarantine(&key);
                report.invalid.push(key);
            }
            tokio::time::sleep(self.probe_delay).await;
        }

        let merged = already_invalid
            .into_iter()
            .chain(report.invalid.iter().cloned());
        report.persisted = self.record_invalid(merged).await;

        info!(
            admitted = report.admitted.len(),
            invalid = report.invalid.len(),
            active = self.pool.len(),
            "key check finished"
        );
        report
    }

    /// Run `probe_batch` as a background task.
    pub fn probe_batch_background(
        self: &Arc<Self>,
        candidates: Vec<Credential>,
        already_invalid: Vec<Credential>,
    ) -> tokio::task::JoinHandle<BatchReport> {
        let checker = Arc::clone(self);
        info!(candidates = candidates.len(), "starting background key check");
        tokio::spawn(async move { checker.probe_batch(candidates, already_invalid).await })
    }

    /// Explicit revalidation pass over the persisted invalid set.
    ///
    /// Keys that pass are admitted and removed from the invalid set; keys
    /// that still fail stay quarantined.
    pub async fn revalidate_invalid(&self) -> BatchReport {
        let candidates: Vec<Credential> = self.store.invalid_keys().await.into_iter().collect();
        info!(candidates = candidates.len(), "revalidating invalid keys");

        let mut report = BatchReport::default();
        let mut passed = Vec::new();
        for key in candidates {
            if self.probe_one(&key).await {
                info!(key = %key, "previously invalid key passed revalidation");
                self.pool.admit(key.clone());
                passed.push(key.clone());
                report.admitted.push(key);
            } else {
                report.invalid.push(key);
            }
            tokio::time::sleep(self.probe_delay).await;
        }

        report.persisted = match self.store.clear_invalid(passed).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "failed to persist revalidated keys");
                false
            }
        };
        report
    }

    /// Probe a key and admit it if it passes (operator-initiated admit).
    ///
    /// A passing key is also registered as configured and removed from the
    /// persisted invalid set.
    pub async fn admit_verified(&self, key: Credential) -> bool {
        if !self.probe_one(&key).await {
            warn!(key = %key, "refusing to admit key that failed validation");
            return false;
        }
        self.pool.admit(key.clone());
        if let Err(e) = self.store.register_keys([key.clone()]).await {
            warn!(key = %key, error = %e, "failed to persist admitted key");
        }
        if let Err(e) = self.store.clear_invalid([key]).await {
            warn!(error = %e, "failed to persist invalid key removal");
        }
        true
    }

    /// Quarantine a key after an upstream rejection and record it as invalid.
    ///
    /// Returns whether the key was active. A persistence failure is logged
    /// and does not undo the quarantine.
    pub async fn quarantine_and_record(&self, key: &Credential) -> bool {
        let removed = self.pool.quarantine(key);
        self.record_invalid([key.clone()]).await;
        removed
    }

    async fn record_invalid(&self, keys: impl IntoIterator<Item = Credential>) -> bool {
        match self.store.merge_invalid(keys).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "failed to persist invalid keys, in-memory quarantine stands");
                false
            }
        }
    }
}
