//! Per-request error types
//!
//! Every failure the gateway produces itself (as opposed to upstream error
//! responses, which pass through verbatim) is rendered as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Which request limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Client,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LimitScope::Global => "request rate limit exceeded, try again later",
            LimitScope::Client => "daily request limit for this client exceeded",
        })
    }
}

/// Gateway-originated request failures.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no available credential")]
    NoCredential,

    #[error("missing or invalid password")]
    Unauthorized,

    #[error("{0}")]
    RateLimited(LimitScope),

    #[error("request cancelled after exceeding the maximum request age")]
    Cancelled,

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoCredential => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Cancelled | ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `error.type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::NoCredential => "no_available_credential",
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::RateLimited(_) => "rate_limited",
            ProxyError::Cancelled => "request_cancelled",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// JSON body for this error.
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        })
    }

    pub fn into_response(self, request_id: &str) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body(request_id).to_string(),
        )
            .into_response()
    }
}
