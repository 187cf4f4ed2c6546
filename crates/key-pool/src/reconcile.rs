//! Startup reconciliation
//!
//! Builds the initial active pool from persisted settings plus keys supplied
//! through the environment. Blocks only until one usable key is found so the
//! gateway can start serving; everything else is validated in the background.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::credential::Credential;
use crate::error::Result;
use crate::health::{BatchReport, HealthChecker};

/// What startup reconciliation did.
#[derive(Debug)]
pub struct StartupReport {
    /// Key admitted synchronously, if one passed
    pub first_valid: Option<Credential>,
    /// Candidates rejected during the blocking scan
    pub initially_invalid: Vec<Credential>,
    /// Background pass over the remaining candidates, if any were left
    pub background: Option<JoinHandle<BatchReport>>,
}

/// Reconcile configured keys with the persisted invalid set and populate the
/// pool.
///
/// `extra` keys (from `GEMINI_API_KEYS`) are registered as configured first.
/// Keys already recorded as invalid are not probed. With `skip_check`, every
/// remaining candidate is admitted without probing.
pub async fn reconcile(
    checker: Arc<HealthChecker>,
    extra: Vec<Credential>,
    skip_check: bool,
) -> Result<StartupReport> {
    let store = checker.store();
    if !extra.is_empty() && store.register_keys(extra).await? {
        info!("registered keys from environment");
    }

    let invalid = store.invalid_keys().await;
    let candidates: Vec<Credential> = store
        .configured_keys()
        .await
        .into_iter()
        .filter(|k| !invalid.contains(k))
        .collect();
    info!(
        candidates = candidates.len(),
        known_invalid = invalid.len(),
        "reconciling keys"
    );

    let pool = checker.pool();
    if skip_check {
        warn!("key validation skipped, admitting all candidates");
        for key in candidates {
            pool.admit(key);
        }
        return Ok(StartupReport {
            first_valid: None,
            initially_invalid: Vec::new(),
            background: None,
        });
    }

    let first = checker.find_first_valid(candidates).await;
    match &first.found {
        Some(key) => {
            pool.admit(key.clone());
        }
        None => error!("no valid API key found, requests will fail until one is admitted"),
    }

    let background = if first.remaining.is_empty() {
        if let Err(e) = store.merge_invalid(first.invalid.iter().cloned()).await {
            warn!(error = %e, "failed to persist invalid keys");
        }
        None
    } else {
        Some(checker.probe_batch_background(first.remaining, first.invalid.clone()))
    };

    Ok(StartupReport {
        first_valid: first.found,
        initially_invalid: first.invalid,
        background,
    })
}
