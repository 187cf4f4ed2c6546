//! Credential pool for the key gateway
//!
//! Holds the operator's interchangeable upstream API keys, hands them out in
//! rotation, quarantines keys that go bad, and revalidates them. The pool is
//! purely in-memory; the persisted view of which keys are known invalid lives
//! in `SettingsStore`.
//!
//! Credential lifecycle:
//! 1. Keys come from the settings file and `GEMINI_API_KEYS`
//! 2. Startup reconciliation probes keys until one works, admits it, and
//!    validates the rest in the background
//! 3. Request path allocates keys round-robin
//! 4. Upstream 401/403/quota errors → key quarantined and persisted as invalid
//! 5. Invalid keys return only through an explicit revalidation pass or admit

pub mod credential;
pub mod error;
pub mod health;
pub mod pool;
pub mod reconcile;
pub mod store;

pub use credential::{Credential, parse_key_list};
pub use error::{Error, Result};
pub use health::{BatchReport, FirstValid, HealthChecker};
pub use pool::{CredentialPool, PoolSnapshot};
pub use reconcile::{StartupReport, reconcile};
pub use store::{PersistedKeys, SettingsStore};
