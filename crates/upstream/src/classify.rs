//! Classification of upstream error responses
//!
//! Distinguishes credential problems (rejected or quota-exhausted keys, which
//! must be quarantined) from transient failures that say nothing about the key.

/// What an upstream error response means for the credential that was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable, no pool action (timeouts, 5xx, plain rate limits)
    Transient,
    /// Key has exhausted its quota; quarantine and fail over
    QuotaExceeded,
    /// Key is rejected by upstream; quarantine and fail over
    Invalid,
}

impl ErrorClassification {
    /// Whether the credential should leave the active pool.
    pub fn quarantines(self) -> bool {
        matches!(
            self,
            ErrorClassification::QuotaExceeded | ErrorClassification::Invalid
        )
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Invalid => "invalid_key",
        }
    }
}

/// Quota exhaustion phrases in Gemini 429 bodies.
const QUOTA_PATTERNS: &[&str] = &[
    "resource_exhausted",
    "exceeded your current quota",
    "quota exceeded",
    "quota_failure",
];

/// Phrases Gemini uses when a key itself is bad. These arrive as 400s.
const INVALID_KEY_PATTERNS: &[&str] = &[
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "permission_denied",
];

fn body_matches(body: &str, patterns: &[&str]) -> bool {
    let lower = body.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify an upstream error by HTTP status and response body.
///
/// 401/403 are always `Invalid`. A 400 is `Invalid` only when the body names
/// the key as the problem; other 400s are the client's fault. 429 is
/// `QuotaExceeded` when the body carries a quota marker, otherwise `Transient`.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::Invalid,
        400 if body_matches(body, INVALID_KEY_PATTERNS) => ErrorClassification::Invalid,
        429 if body_matches(body, QUOTA_PATTERNS) => ErrorClassification::QuotaExceeded,
        _ => ErrorClassification::Transient,
    }
}
