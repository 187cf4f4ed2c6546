//! Per-request state for the key gateway
//!
//! Two in-memory stores shared by every request handler, plus the periodic
//! job that keeps them bounded:
//! - `ResponseCache`: fingerprint → stored response, with expiry and
//!   oldest-first capacity eviction
//! - `ActiveRequests`: request id → handle of the in-flight upstream call,
//!   so stale work can be cancelled and finished work reaped
//! - `spawn_maintenance_task`: sweeps both on a fixed interval
//!
//! Store operations never perform I/O and never await; each store guards its
//! map with its own lock.

pub mod cache;
pub mod maintenance;
pub mod tracker;

pub use cache::{Fingerprint, ResponseCache};
pub use maintenance::{TickReport, run_maintenance_tick, spawn_maintenance_task};
pub use tracker::{ActiveRequests, TaskHandle, WorkHandle};
