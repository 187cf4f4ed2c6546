//! Periodic maintenance of the response cache and request tracker
//!
//! Each tick runs three steps in order: sweep expired cache entries, reap
//! completed requests, cancel long-running requests. A step that panics is
//! logged and skipped; the remaining steps and all later ticks still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::cache::ResponseCache;
use crate::tracker::{ActiveRequests, WorkHandle};

/// Per-step results of one tick. `None` means the step failed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub expired: Option<usize>,
    pub reaped: Option<usize>,
    pub cancelled: Option<usize>,
}

/// Spawn the maintenance loop.
///
/// Ticks every `interval`; the first tick fires one interval after spawn.
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_maintenance_task<V, H>(
    cache: Arc<ResponseCache<V>>,
    tracker: Arc<ActiveRequests<H>>,
    interval: Duration,
    max_request_age: Duration,
) -> tokio::task::JoinHandle<()>
where
    V: Clone + Send + 'static,
    H: WorkHandle + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick, nothing has aged yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = run_maintenance_tick(&cache, &tracker, max_request_age);
            debug!(?report, "maintenance tick finished");
        }
    })
}

/// Run one maintenance tick.
pub fn run_maintenance_tick<V, H>(
    cache: &ResponseCache<V>,
    tracker: &ActiveRequests<H>,
    max_request_age: Duration,
) -> TickReport
where
    V: Clone,
    H: WorkHandle,
{
    TickReport {
        expired: isolated("sweep_expired", || cache.sweep_expired()),
        reaped: isolated("clean_completed", || tracker.clean_completed()),
        cancelled: isolated("clean_long_running", || {
            tracker.clean_long_running(max_request_age)
        }),
    }
}

fn isolated(step: &'static str, f: impl FnOnce() -> usize) -> Option<usize> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(count) => Some(count),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(step, reason = %reason, "maintenance step failed, skipping");
            None
        }
    }
}
