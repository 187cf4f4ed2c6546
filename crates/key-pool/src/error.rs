//! Error types for pool operations

/// Errors from pool and persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable credential. Callers surface this as service unavailable.
    #[error("no available credential: active pool is empty")]
    EmptyPool,

    /// Writing the settings file failed. In-memory pool state is unaffected.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("settings parse error: {0}")]
    SettingsParse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
