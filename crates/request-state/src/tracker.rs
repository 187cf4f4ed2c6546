//! Active-request tracking
//!
//! Maps request ids to handles of the upstream calls serving them. The
//! tracker never drives work itself: it observes handles through `WorkHandle`,
//! reaps entries whose work is done, and requests cancellation of work that
//! has run too long. The owning request path removes its own entry when the
//! work completes; reaping covers the cases where it could not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capabilities the tracker needs from a unit of work.
pub trait WorkHandle: Send + Sync {
    /// The work ran to completion (successfully, with an error, or aborted).
    fn is_finished(&self) -> bool;

    /// Cancellation was requested.
    fn is_cancelled(&self) -> bool;

    /// Request cooperative cancellation. Must be safe to call more than once.
    fn cancel(&self);
}

/// `WorkHandle` over a spawned tokio task.
#[derive(Debug)]
pub struct TaskHandle {
    abort: AbortHandle,
    cancelled: AtomicBool,
}

impl TaskHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self {
            abort,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn for_task<T>(task: &tokio::task::JoinHandle<T>) -> Self {
        Self::new(task.abort_handle())
    }
}

impl WorkHandle for TaskHandle {
    fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }
}

struct Entry<H> {
    handle: Arc<H>,
    created_at: Instant,
}

/// Registry of in-flight work keyed by request id.
pub struct ActiveRequests<H = TaskHandle> {
    entries: Mutex<HashMap<String, Entry<H>>>,
}

impl<H> Default for ActiveRequests<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: WorkHandle> ActiveRequests<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<H>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register running work under `id`, stamped with the current time.
    ///
    /// An id maps to at most one entry; registering an id that is already
    /// tracked replaces the old entry.
    pub fn add(&self, id: impl Into<String>, handle: H) -> Arc<H> {
        let id = id.into();
        let handle = Arc::new(handle);
        let entry = Entry {
            handle: Arc::clone(&handle),
            created_at: Instant::now(),
        };
        if self.lock().insert(id.clone(), entry).is_some() {
            warn!(request_id = %id, "request id registered twice, replacing entry");
        }
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<H>> {
        self.lock().get(id).map(|entry| Arc::clone(&entry.handle))
    }

    /// Unregister `id`. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose work is finished or cancelled.
    /// Returns how many were removed.
    pub fn clean_completed(&self) -> usize {
        let mut entries = self.lock();
        let done: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished() || entry.handle.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            entries.remove(id);
        }
        if !done.is_empty() {
            debug!(count = done.len(), remaining = entries.len(), "reaped completed requests");
        }
        done.len()
    }

    /// Request cancellation of every entry older than `max_age` that is
    /// neither finished nor already cancelled. Entries stay tracked until
    /// their work reports finished. Returns how many were cancelled.
    pub fn clean_long_running(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<(String, Arc<H>)> = self
            .lock()
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.created_at) > max_age
                    && !entry.handle.is_finished()
                    && !entry.handle.is_cancelled()
            })
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.handle)))
            .collect();

        for (id, handle) in &stale {
            debug!(request_id = %id, "cancelling long-running request");
            handle.cancel();
        }

        let count = stale.len();
        if count > 0 {
            metrics::counter!("active_requests_cancelled_total").increment(count as u64);
            warn!(
                count,
                max_age_secs = max_age.as_secs(),
                "cancelled long-running requests"
            );
        }
        count
    }
}
