//! Admin API for key and request-state management
//!
//! Runs on a separate listener (`server.admin_listen_addr`) and is disabled
//! when that is unset. Keys are only ever returned masked.
//!
//! Endpoints:
//! - GET    /admin/keys              active keys, rotation version, invalid count
//! - POST   /admin/keys              probe a key and admit it if it passes
//! - POST   /admin/keys/quarantine   remove a key from rotation and record it invalid
//! - POST   /admin/keys/revalidate   re-probe persisted invalid keys in the background
//! - GET    /admin/cache             cache entry count and limits
//! - DELETE /admin/cache             drop all cached responses
//! - GET    /admin/requests          number of tracked in-flight upstream calls

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::{Credential, HealthChecker};
use request_state::{ActiveRequests, ResponseCache};
use serde::Deserialize;
use tracing::info;

use crate::proxy::BufferedResponse;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    checker: Arc<HealthChecker>,
    cache: Arc<ResponseCache<BufferedResponse>>,
    tracker: Arc<ActiveRequests>,
}

impl AdminState {
    pub fn new(
        checker: Arc<HealthChecker>,
        cache: Arc<ResponseCache<BufferedResponse>>,
        tracker: Arc<ActiveRequests>,
    ) -> Self {
        Self {
            checker,
            cache,
            tracker,
        }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(admit_key))
        .route("/admin/keys/quarantine", post(quarantine_key))
        .route("/admin/keys/revalidate", post(revalidate_keys))
        .route("/admin/cache", get(cache_status).delete(clear_cache))
        .route("/admin/requests", get(active_requests))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

#[derive(Deserialize)]
struct KeyRequest {
    key: String,
}

impl KeyRequest {
    fn credential(&self) -> Option<Credential> {
        let raw = self.key.trim();
        (!raw.is_empty()).then(|| Credential::new(raw))
    }
}

/// GET /admin/keys
async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    let mut body = state.checker.pool().health();
    body["invalid_keys"] = state.checker.store().invalid_keys().await.len().into();
    json_response(StatusCode::OK, body)
}

/// POST /admin/keys
///
/// Responds 422 when the key fails its probe.
async fn admit_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeyRequest>,
) -> impl IntoResponse {
    let Some(key) = body.credential() else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "key must not be empty" }),
        );
    };

    if !state.checker.admit_verified(key.clone()).await {
        return json_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            serde_json::json!({
                "key": key.masked(),
                "error": "key failed validation",
            }),
        );
    }

    info!(key = %key, "key admitted via admin API");
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "key": key.masked(),
            "status": "admitted",
            "keys_active": state.checker.pool().len(),
        }),
    )
}

/// POST /admin/keys/quarantine
async fn quarantine_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeyRequest>,
) -> impl IntoResponse {
    let Some(key) = body.credential() else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "key must not be empty" }),
        );
    };

    let was_active = state.checker.quarantine_and_record(&key).await;
    info!(key = %key, was_active, "key quarantined via admin API");
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "key": key.masked(),
            "status": "quarantined",
            "was_active": was_active,
            "keys_active": state.checker.pool().len(),
        }),
    )
}

/// POST /admin/keys/revalidate
///
/// Runs in the background and responds 202 immediately.
async fn revalidate_keys(State(state): State<AdminState>) -> impl IntoResponse {
    let checker = Arc::clone(&state.checker);
    tokio::spawn(async move {
        let report = checker.revalidate_invalid().await;
        info!(
            admitted = report.admitted.len(),
            still_invalid = report.invalid.len(),
            "revalidation finished"
        );
    });
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "status": "revalidation started" }),
    )
}

/// GET /admin/cache
async fn cache_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "entries": state.cache.len(),
            "max_entries": state.cache.max_entries(),
            "expiry_secs": state.cache.expiry().as_secs(),
        }),
    )
}

/// DELETE /admin/cache
async fn clear_cache(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.cache.clear();
    info!(cleared, "response cache cleared via admin API");
    json_response(StatusCode::OK, serde_json::json!({ "cleared": cleared }))
}

/// GET /admin/requests
async fn active_requests(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "active_requests": state.tracker.len() }),
    )
}
