//! Upstream boundary for the key gateway
//!
//! Defines the `Probe` trait used by health checking to ask the upstream
//! generative-AI service whether a credential is usable, a reqwest-backed
//! implementation for the Gemini API, and classification of upstream error
//! responses into pool actions.
//!
//! Probes are fail-closed: any transport or authorization failure is reported
//! as "not valid" rather than as an error, so callers never have to handle
//! probe errors on the request path.

pub mod classify;
pub mod error;
pub mod gemini;

pub use classify::{ErrorClassification, classify_status};
pub use error::ProbeError;
pub use gemini::{DEFAULT_UPSTREAM_URL, GeminiProbe};

use std::future::Future;
use std::pin::Pin;

/// Validation probe collaborator.
///
/// Given one raw credential, performs a minimal upstream call and returns
/// whether the credential is usable. Implementations must return `false` on
/// transport failures and upstream rejections alike.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Probe>`).
pub trait Probe: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Check one credential. Never errors; failures map to `false`.
    fn check<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}
