//! Pooled-key Gemini gateway
//!
//! Single-binary Rust service that:
//! 1. Reconciles configured API keys with the persisted invalid set and
//!    validates them against upstream
//! 2. Forwards client requests upstream, rotating across healthy keys and
//!    failing over when upstream rejects one
//! 3. Caches identical responses and cancels requests that run too long
//! 4. Optionally serves an admin API on a separate listener

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod rate_limit;
mod streaming;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_pool::{CredentialPool, HealthChecker, SettingsStore};
use request_state::{ActiveRequests, ResponseCache, spawn_maintenance_task};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::GeminiProbe;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;
use crate::rate_limit::RateLimiter;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single key validation call.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    let config = if explicit || config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        Config::from_toml("").context("invalid configuration from environment")?
    };

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.server.upstream_url,
        settings_path = %config.keys.settings_path.display(),
        env_keys = config.env_keys.len(),
        password = config.password.is_some(),
        fake_streaming = config.streaming.fake_streaming,
        "configuration loaded"
    );

    let store = SettingsStore::load(config.keys.settings_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load key settings from {}",
                config.keys.settings_path.display()
            )
        })?;

    let client = reqwest::Client::new();
    let probe = GeminiProbe::new(
        client.clone(),
        config.server.upstream_url.clone(),
        PROBE_TIMEOUT,
    );
    let pool = Arc::new(CredentialPool::default());
    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&pool),
        Arc::new(probe),
        Arc::new(store),
        Duration::from_millis(config.keys.probe_delay_ms),
    ));

    let startup = key_pool::reconcile(
        Arc::clone(&checker),
        config.env_keys.clone(),
        config.keys.skip_check,
    )
    .await
    .context("key reconciliation failed")?;
    info!(
        active = pool.len(),
        rejected = startup.initially_invalid.len(),
        background_check = startup.background.is_some(),
        "key reconciliation finished"
    );

    let cache = Arc::new(ResponseCache::new(
        Duration::from_secs(config.cache.expiry_secs),
        config.cache.max_entries,
    ));
    let tracker: Arc<ActiveRequests> = Arc::new(ActiveRequests::new());
    let maintenance = spawn_maintenance_task(
        Arc::clone(&cache),
        Arc::clone(&tracker),
        Duration::from_secs(config.maintenance.interval_secs),
        Duration::from_secs(config.maintenance.max_request_age_secs),
    );

    let proxy_state = ProxyState {
        client,
        upstream_url: config.server.upstream_url.clone(),
        timeout: config.timeout(),
        max_attempts: config.server.max_attempts,
        checker: Arc::clone(&checker),
        cache: Arc::clone(&cache),
        tracker: Arc::clone(&tracker),
        limiter: Arc::new(RateLimiter::new(
            config.limits.max_requests_per_minute,
            config.limits.max_requests_per_day_per_ip,
        )),
        password: config.password.clone(),
        fake_streaming: config.streaming.fake_streaming,
        stream_interval: Duration::from_secs(config.streaming.fake_streaming_interval_secs),
    };

    let app_state = AppState {
        proxy: proxy_state,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let admin_shutdown = match config.server.admin_listen_addr {
        Some(admin_addr) => {
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
            let admin_app = admin::build_admin_router(AdminState::new(
                Arc::clone(&checker),
                Arc::clone(&cache),
                Arc::clone(&tracker),
            ));
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(async move {
                let served = axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async {
                        let _ = rx.await;
                    })
                    .await;
                if let Err(e) = served {
                    error!(error = %e, "admin server error");
                }
            });
            info!(addr = %admin_addr, "admin API listening");
            Some(tx)
        }
        None => None,
    };

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT bounds how long a slow client can delay exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    if let Some(tx) = admin_shutdown {
        let _ = tx.send(());
    }

    // The drain timer starts at signal receipt
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                remaining = tracker.len(),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    maintenance.abort();
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while at least one key is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.proxy.checker.pool().health();
    let healthy = body["status"] == "healthy";
    body["cache_entries"] = state.proxy.cache.len().into();
    body["active_requests"] = state.proxy.tracker.len().into();
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    let status_code = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards every other request upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = request.method().to_string();
    let started = Instant::now();
    let response = proxy::proxy_request(&state.proxy, request, request_id).await;
    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request, StatusCode};
    use common::Secret;
    use key_pool::Credential;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    struct TestGateway {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    impl TestGateway {
        fn router(&self) -> Router {
            build_router(self.state.clone(), 1000)
        }

        fn pool(&self) -> &Arc<CredentialPool> {
            self.state.proxy.checker.pool()
        }

        async fn invalid_keys(&self) -> Vec<String> {
            self.state
                .proxy
                .checker
                .store()
                .invalid_keys()
                .await
                .iter()
                .map(|k| k.expose().to_string())
                .collect()
        }
    }

    /// Gateway state with the given active keys, pointed at `upstream_url`.
    async fn test_gateway(upstream_url: &str, keys: &[&str]) -> TestGateway {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"))
            .await
            .unwrap();
        let client = reqwest::Client::new();
        let probe = GeminiProbe::new(client.clone(), upstream_url, Duration::from_secs(5));
        let pool = CredentialPool::new(keys.iter().map(Credential::new).collect());
        let checker = Arc::new(HealthChecker::new(
            Arc::new(pool),
            Arc::new(probe),
            Arc::new(store),
            Duration::ZERO,
        ));

        let state = AppState {
            proxy: ProxyState {
                client,
                upstream_url: upstream_url.to_string(),
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                checker,
                cache: Arc::new(ResponseCache::new(Duration::from_secs(60), 100)),
                tracker: Arc::new(ActiveRequests::new()),
                limiter: Arc::new(RateLimiter::new(0, 0)),
                password: None,
                fake_streaming: false,
                stream_interval: Duration::from_secs(1),
            },
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        TestGateway { state, _dir: dir }
    }

    /// Start a mock Gemini upstream.
    ///
    /// The API key decides the answer: `bad-key` gets 403, `quota-key` gets a
    /// quota-exhausted 429, `slow-key` stalls for 30s. Paths containing
    /// `badrequest` get a plain 400. Anything else is echoed back as JSON.
    async fn start_mock_upstream() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        tokio::spawn(async move {
            let app = Router::new().fallback(move |request: Request<Body>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let key = request
                        .headers()
                        .get("x-goog-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();
                    let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                        .await
                        .unwrap();

                    let (status, json) = match key.as_str() {
                        "bad-key" => (
                            StatusCode::FORBIDDEN,
                            serde_json::json!({"error": {"code": 403, "status": "PERMISSION_DENIED"}}),
                        ),
                        "quota-key" => (
                            StatusCode::TOO_MANY_REQUESTS,
                            serde_json::json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED"}}),
                        ),
                        "slow-key" => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            (StatusCode::OK, serde_json::json!({}))
                        }
                        _ if path.contains("badrequest") => (
                            StatusCode::BAD_REQUEST,
                            serde_json::json!({"error": {"code": 400, "message": "unknown field"}}),
                        ),
                        _ => (
                            StatusCode::OK,
                            serde_json::json!({
                                "key": key,
                                "path": path,
                                "query": query,
                                "echoed_headers": headers_map,
                                "body": String::from_utf8_lossy(&body),
                            }),
                        ),
                    };
                    (status, [("x-upstream-echo", "true")], axum::Json(json))
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, calls)
    }

    fn generate(model: &str, text: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/v1beta/models/{model}:generateContent"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"contents": [{"parts": [{"text": text}]}]}).to_string(),
            ))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, headers, body)
    }

    fn json(body: &Bytes) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_pool_and_counts() {
        let gw = test_gateway("http://unused", &["AIzaSyHEALTHY01"]).await;
        let (status, _, body) = send(
            gw.router(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json = json(&body);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["keys_active"], 1);
        assert_eq!(json["cache_entries"], 0);
        assert_eq!(json["active_requests"], 0);
        assert!(json["uptime_seconds"].is_u64());
        assert!(!String::from_utf8_lossy(&body).contains("AIzaSyHEALTHY01"));
    }

    #[tokio::test]
    async fn health_is_unavailable_with_empty_pool() {
        let gw = test_gateway("http://unused", &[]).await;
        let (status, _, body) = send(
            gw.router(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(&body)["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text_plain() {
        let gw = test_gateway("http://unused", &[]).await;
        let (status, headers, _) = send(
            gw.router(),
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let content_type = headers.get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn forwards_with_pooled_key_and_strips_client_credentials() {
        let (url, _) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;

        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:generateContent?key=client-key&foo=bar")
            .header("content-type", "application/json")
            .header("authorization", "Bearer client-token")
            .header("connection", "keep-alive")
            .header("x-custom", "preserved")
            .body(Body::from(r#"{"contents":[]}"#))
            .unwrap();
        let (status, headers, body) = send(gw.router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-upstream-echo").unwrap(), "true");
        let json = json(&body);
        assert_eq!(json["key"], "good-key");
        assert_eq!(json["path"], "/v1beta/models/gemini-pro:generateContent");
        assert_eq!(json["query"], "foo=bar");
        assert_eq!(json["body"], r#"{"contents":[]}"#);
        assert_eq!(json["echoed_headers"]["x-custom"], "preserved");
        assert!(json["echoed_headers"].get("authorization").is_none());
        assert!(json["echoed_headers"].get("connection").is_none());
    }

    #[tokio::test]
    async fn requests_rotate_across_keys() {
        let (url, _) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["key-a", "key-b"]).await;

        let mut used = Vec::new();
        for text in ["one", "two", "three"] {
            let (status, _, body) = send(gw.router(), generate("gemini-pro", text)).await;
            assert_eq!(status, StatusCode::OK);
            used.push(json(&body)["key"].as_str().unwrap().to_string());
        }
        assert_eq!(used, ["key-a", "key-b", "key-a"]);
    }

    #[tokio::test]
    async fn rejected_keys_are_quarantined_and_request_fails_over() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["bad-key", "quota-key", "good-key"]).await;

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["key"], "good-key");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(gw.pool().snapshot(), vec![Credential::new("good-key")]);
        assert_eq!(gw.invalid_keys().await, ["bad-key", "quota-key"]);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_upstream_error() {
        let (url, _) = start_mock_upstream().await;
        let mut gw = test_gateway(&url, &["bad-key", "good-key"]).await;
        gw.state.proxy.max_attempts = 1;

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json(&body)["error"]["status"], "PERMISSION_DENIED");
        assert_eq!(gw.pool().snapshot(), vec![Credential::new("good-key")]);
    }

    #[tokio::test]
    async fn quarantining_last_key_yields_no_available_credential() {
        let (url, _) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["bad-key"]).await;

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(&body)["error"]["type"], "no_available_credential");
        assert!(gw.pool().is_empty());
    }

    #[tokio::test]
    async fn empty_pool_returns_503_without_calling_upstream() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &[]).await;

        let (status, headers, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        let json = json(&body);
        assert_eq!(json["error"]["type"], "no_available_credential");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_errors_pass_through_without_quarantine() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;

        for _ in 0..2 {
            let (status, _, body) = send(gw.router(), generate("badrequest", "hi")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json(&body)["error"]["message"], "unknown field");
        }

        assert!(gw.pool().contains(&Credential::new("good-key")));
        assert!(gw.invalid_keys().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "errors must not be cached");
    }

    #[tokio::test]
    async fn identical_requests_are_served_from_cache() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;

        let (_, _, first) = send(gw.router(), generate("gemini-pro", "same")).await;
        let (status, _, second) = send(gw.router(), generate("gemini-pro", "same")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.state.proxy.cache.len(), 1);

        // A different model is a different request
        send(gw.router(), generate("gemini-flash", "same")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn post(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn cache_separates_methods_on_same_model() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;
        let contents = serde_json::json!({"contents": [{"parts": [{"text": "same"}]}]});

        let (_, _, counted) = send(
            gw.router(),
            post("/v1beta/models/gemini-pro:countTokens", contents.clone()),
        )
        .await;
        let (status, _, generated) = send(
            gw.router(),
            post("/v1beta/models/gemini-pro:generateContent", contents),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(json(&counted)["path"], "/v1beta/models/gemini-pro:countTokens");
        assert_eq!(json(&generated)["path"], "/v1beta/models/gemini-pro:generateContent");
    }

    #[tokio::test]
    async fn cache_separates_embeddings_by_content() {
        let (url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;
        let embed = "/v1beta/models/text-embedding-004:embedContent";

        send(
            gw.router(),
            post(embed, serde_json::json!({"content": {"parts": [{"text": "apple"}]}})),
        )
        .await;
        let (_, _, banana) = send(
            gw.router(),
            post(embed, serde_json::json!({"content": {"parts": [{"text": "banana"}]}})),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let echoed = json(&banana)["body"].as_str().unwrap().to_string();
        assert!(echoed.contains("banana"), "got: {echoed}");
        assert!(!echoed.contains("apple"));
    }

    #[tokio::test]
    async fn password_is_required_when_configured() {
        let (url, _) = start_mock_upstream().await;
        let mut gw = test_gateway(&url, &["good-key"]).await;
        gw.state.proxy.password = Some(Secret::new("hunter2".to_string()));

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json(&body)["error"]["type"], "unauthorized");

        let mut request = generate("gemini-pro", "hi");
        request.headers_mut().insert(
            "x-goog-api-key",
            axum::http::HeaderValue::from_static("hunter2"),
        );
        let (status, _, body) = send(gw.router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["key"], "good-key", "password must not reach upstream");

        let (status, _, _) = send(
            gw.router(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_returns_429() {
        let (url, _) = start_mock_upstream().await;
        let mut gw = test_gateway(&url, &["good-key"]).await;
        gw.state.proxy.limiter = Arc::new(RateLimiter::new(1, 0));

        let (status, _, _) = send(gw.router(), generate("gemini-pro", "one")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "two")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json(&body)["error"]["type"], "rate_limited");
    }

    #[tokio::test]
    async fn fake_streaming_wraps_unary_response_in_sse() {
        let (url, _) = start_mock_upstream().await;
        let mut gw = test_gateway(&url, &["good-key"]).await;
        gw.state.proxy.fake_streaming = true;

        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:streamGenerateContent?alt=sse")
            .body(Body::from(r#"{"contents":[]}"#))
            .unwrap();
        let (status, headers, body) = send(gw.router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
        let text = String::from_utf8(body.to_vec()).unwrap();
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("one data event");
        let echoed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(echoed["path"], "/v1beta/models/gemini-pro:generateContent");
        assert_eq!(echoed["query"], "");

        // The complete response was cached
        assert_eq!(gw.state.proxy.cache.len(), 1);
    }

    #[tokio::test]
    async fn streaming_passes_through_when_not_faked() {
        let (url, _) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["good-key"]).await;

        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-pro:streamGenerateContent?alt=sse")
            .body(Body::from(r#"{"contents":[]}"#))
            .unwrap();
        let (status, _, body) = send(gw.router(), request).await;

        assert_eq!(status, StatusCode::OK);
        let json = json(&body);
        assert_eq!(json["path"], "/v1beta/models/gemini-pro:streamGenerateContent");
        assert_eq!(json["query"], "alt=sse");
        assert!(gw.state.proxy.cache.is_empty(), "streamed bodies are not cached");
    }

    #[tokio::test]
    async fn dead_upstream_returns_502() {
        let gw = test_gateway("http://127.0.0.1:1", &["good-key"]).await;

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json(&body)["error"]["type"], "upstream_error");
        assert!(gw.pool().contains(&Credential::new("good-key")));
    }

    #[tokio::test]
    async fn upstream_timeout_returns_504() {
        let (url, _) = start_mock_upstream().await;
        let mut gw = test_gateway(&url, &["slow-key"]).await;
        gw.state.proxy.timeout = Duration::from_millis(200);

        let (status, _, body) = send(gw.router(), generate("gemini-pro", "hi")).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json(&body)["error"]["type"], "upstream_timeout");
        assert!(gw.state.proxy.tracker.is_empty());
    }

    #[tokio::test]
    async fn stale_request_cancelled_by_tracker_returns_504() {
        let (url, _) = start_mock_upstream().await;
        let gw = test_gateway(&url, &["slow-key"]).await;
        let tracker = Arc::clone(&gw.state.proxy.tracker);

        let app = gw.router();
        let pending = tokio::spawn(send(app, generate("gemini-pro", "hi")));

        for _ in 0..200 {
            if !tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.len(), 1, "upstream call should be tracked");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.clean_long_running(Duration::from_millis(10)), 1);

        let (status, _, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json(&body)["error"]["type"], "request_cancelled");
        assert!(tracker.is_empty());
    }
}
