//! Request forwarding
//!
//! Each inbound request is checked against the shared password and the rate
//! limits, answered from the response cache when possible, and otherwise
//! forwarded upstream with a pooled credential. Credentials rejected by
//! upstream (invalid or quota-exhausted) are quarantined and the request is
//! retried with the next key in rotation.
//!
//! Every upstream call runs as its own task, registered in the active-request
//! tracker under the request id so the maintenance loop can cancel it once it
//! exceeds the maximum request age.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::Secret;
use key_pool::{Credential, HealthChecker};
use request_state::{ActiveRequests, Fingerprint, ResponseCache, TaskHandle};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};
use upstream::classify_status;
use upstream::gemini::API_KEY_HEADER;

use crate::error::ProxyError;
use crate::metrics;
use crate::rate_limit::{RateLimiter, client_ip};
use crate::streaming;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client headers replaced by the gateway: the client's own credentials never
/// reach upstream, and reqwest sets host and length itself.
const REPLACED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    API_KEY_HEADER,
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// A fully read upstream response, as stored in the response cache.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if !is_hop_by_hop(name.as_str()) && name != header::CONTENT_LENGTH {
                headers.append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub checker: Arc<HealthChecker>,
    pub cache: Arc<ResponseCache<BufferedResponse>>,
    pub tracker: Arc<ActiveRequests>,
    pub limiter: Arc<RateLimiter>,
    pub password: Option<Secret<String>>,
    pub fake_streaming: bool,
    pub stream_interval: Duration,
}

/// Upstream request with everything but the credential decided.
struct Outbound {
    request_id: String,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    /// Hand back 2xx responses unread so their body can be streamed through
    stream_through: bool,
}

enum Upstream {
    Buffered(BufferedResponse),
    Streaming(reqwest::Response),
}

/// Proxy an inbound request upstream with credential failover.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    match handle(state, request, &request_id).await {
        Ok(response) => response,
        Err(e) => e.into_response(&request_id),
    }
}

async fn handle(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: &str,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    if let Some(password) = &state.password
        && !is_authorized(password, &parts.headers, parts.uri.query())
    {
        warn!("rejected request with missing or wrong password");
        return Err(ProxyError::Unauthorized);
    }

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_ip(&parts.headers, peer);
    state
        .limiter
        .check(&client)
        .map_err(ProxyError::RateLimited)?;

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to read request body");
            ProxyError::InvalidRequest(e.to_string())
        })?;
    let mut json: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };

    let path = parts.uri.path().to_string();
    let query = strip_query_param(parts.uri.query(), "key");
    let wants_stream = streaming::is_streaming_request(&path, query.as_deref(), json.as_ref());
    let operation = format!("{} {}", parts.method, streaming::unary_path(&path));
    let fingerprint = json.as_ref().and_then(|b| {
        model_name(&path, b).map(|model| Fingerprint::for_request(&operation, &model, b))
    });

    if let Some(fp) = &fingerprint
        && let Some(cached) = state.cache.get(fp)
    {
        debug!(fingerprint = %fp, "serving response from cache");
        if wants_stream {
            return Ok(streaming::single_event(&cached.body));
        }
        return Ok(cached.into_response());
    }

    let fake = wants_stream && state.fake_streaming;
    let (path, query, body_bytes) = if fake {
        let (path, query) = streaming::to_unary(&path, query.as_deref(), json.as_mut());
        let body = match &json {
            Some(value) => Bytes::from(value.to_string()),
            None => body_bytes,
        };
        (path, query, body)
    } else {
        (path, query, body_bytes)
    };

    let url = match &query {
        Some(q) => format!("{}{}?{}", state.upstream_url.trim_end_matches('/'), path, q),
        None => format!("{}{}", state.upstream_url.trim_end_matches('/'), path),
    };
    let outbound = Outbound {
        request_id: request_id.to_string(),
        method: parts.method.clone(),
        url,
        headers: forwardable_headers(&parts.headers),
        body: body_bytes,
        stream_through: wants_stream && !fake,
    };

    if fake {
        let interval = state.stream_interval;
        let state = state.clone();
        let request_id = request_id.to_string();
        let work = async move {
            match forward(&state, &outbound).await {
                Ok(Upstream::Buffered(response)) => {
                    cache_success(&state, fingerprint, &response);
                    response.body
                }
                Ok(Upstream::Streaming(_)) => Bytes::from(
                    ProxyError::Internal("unexpected streaming response".into())
                        .body(&request_id)
                        .to_string(),
                ),
                Err(e) => Bytes::from(e.body(&request_id).to_string()),
            }
        };
        return Ok(streaming::fake_stream(work, interval));
    }

    match forward(state, &outbound).await? {
        Upstream::Buffered(response) => {
            cache_success(state, fingerprint, &response);
            Ok(response.into_response())
        }
        Upstream::Streaming(response) => Ok(stream_response(response)),
    }
}

/// Send `outbound` with successive pooled credentials until upstream accepts
/// one, answers with an error unrelated to the credential, or the attempt
/// budget runs out.
async fn forward(state: &ProxyState, outbound: &Outbound) -> Result<Upstream, ProxyError> {
    let mut last_rejection = None;

    for attempt in 1..=state.max_attempts {
        let key = match state.checker.pool().allocate() {
            Ok(key) => key,
            Err(e) => {
                error!(
                    error = %e,
                    error_type = "no_available_credential",
                    attempt,
                    "no credential available for request"
                );
                return Err(ProxyError::NoCredential);
            }
        };

        let response = match send_tracked(state, outbound, &key).await? {
            Upstream::Buffered(response) => response,
            passthrough @ Upstream::Streaming(_) => return Ok(passthrough),
        };
        if response.status.is_success() {
            return Ok(Upstream::Buffered(response));
        }

        let classification =
            classify_status(response.status.as_u16(), &String::from_utf8_lossy(&response.body));
        metrics::record_upstream_error(classification.label());
        if !classification.quarantines() {
            debug!(status = %response.status, "passing upstream error through");
            return Ok(Upstream::Buffered(response));
        }

        warn!(
            key = %key,
            status = %response.status,
            reason = classification.label(),
            attempt,
            max_attempts = state.max_attempts,
            "upstream rejected credential, failing over"
        );
        state.checker.quarantine_and_record(&key).await;
        last_rejection = Some(response);
    }

    match last_rejection {
        Some(response) => Ok(Upstream::Buffered(response)),
        None => Err(ProxyError::NoCredential),
    }
}

/// One upstream call, run as a tracked task under the request id.
async fn send_tracked(
    state: &ProxyState,
    outbound: &Outbound,
    key: &Credential,
) -> Result<Upstream, ProxyError> {
    let mut headers = outbound.headers.clone();
    let key_value = header::HeaderValue::from_str(key.expose())
        .map_err(|e| ProxyError::Internal(format!("credential is not a valid header value: {e}")))?;
    headers.insert(API_KEY_HEADER, key_value);

    let request = state
        .client
        .request(outbound.method.clone(), &outbound.url)
        .headers(headers)
        .timeout(state.timeout)
        .body(outbound.body.clone());
    let stream_through = outbound.stream_through;

    let task = tokio::spawn(async move {
        let response = request.send().await?;
        if stream_through && response.status().is_success() {
            return Ok(Upstream::Streaming(response));
        }
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>(Upstream::Buffered(BufferedResponse {
            status,
            headers,
            body,
        }))
    });
    state
        .tracker
        .add(outbound.request_id.clone(), TaskHandle::for_task(&task));
    let joined = task.await;
    state.tracker.remove(&outbound.request_id);

    match joined {
        Ok(Ok(upstream)) => Ok(upstream),
        Ok(Err(e)) if e.is_timeout() => {
            metrics::record_upstream_error("timeout");
            error!(error = %e, error_type = "upstream", "upstream timeout");
            Err(ProxyError::UpstreamTimeout(state.timeout.as_secs()))
        }
        Ok(Err(e)) => {
            metrics::record_upstream_error("transport");
            error!(error = %e, error_type = "upstream", "upstream request failed");
            Err(ProxyError::Upstream(e.to_string()))
        }
        Err(e) if e.is_cancelled() => {
            warn!("upstream call cancelled by maintenance");
            Err(ProxyError::Cancelled)
        }
        Err(e) => {
            error!(error = %e, "upstream task panicked");
            Err(ProxyError::Internal("upstream task failed".into()))
        }
    }
}

fn cache_success(state: &ProxyState, fingerprint: Option<Fingerprint>, response: &BufferedResponse) {
    if let Some(fp) = fingerprint
        && response.status.is_success()
    {
        state.cache.put(fp, response.clone());
    }
}

fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) && name != header::CONTENT_LENGTH {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || REPLACED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Whether the request presents the shared password as a bearer token, in
/// the API key header, or as the `key` query parameter.
fn is_authorized(password: &Secret<String>, headers: &HeaderMap, query: Option<&str>) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let query_key = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("key=")))
        .and_then(|raw| urlencoding::decode(raw).ok());

    [bearer, api_key, query_key.as_deref()]
        .into_iter()
        .flatten()
        .any(|presented| password.matches(presented.trim()))
}

fn strip_query_param(query: Option<&str>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty() && !pair.starts_with(&prefix) && *pair != name)
                .collect::<Vec<_>>()
                .join("&")
        })
        .filter(|q| !q.is_empty())
}

/// Model named in the body, or in a `/models/{model}:method` path segment.
fn model_name(path: &str, body: &Value) -> Option<String> {
    if let Some(model) = body.get("model").and_then(Value::as_str) {
        return Some(model.to_string());
    }
    let (_, rest) = path.split_once("/models/")?;
    let model = rest.split([':', '/']).next()?;
    (!model.is_empty()).then(|| model.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("x-goog-api-key"));
    }

    #[test]
    fn client_credentials_are_not_forwarded() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", HeaderValue::from_static("Bearer pw"));
        inbound.insert("x-goog-api-key", HeaderValue::from_static("client-key"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let headers = forwardable_headers(&inbound);
        assert!(headers.get("authorization").is_none());
        assert!(headers.get("x-goog-api-key").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn password_accepted_from_any_location() {
        let password = Secret::new("hunter2".to_string());

        let mut bearer = HeaderMap::new();
        bearer.insert("authorization", HeaderValue::from_static("Bearer hunter2"));
        assert!(is_authorized(&password, &bearer, None));

        let mut api_key = HeaderMap::new();
        api_key.insert("x-goog-api-key", HeaderValue::from_static("hunter2"));
        assert!(is_authorized(&password, &api_key, None));

        assert!(is_authorized(&password, &HeaderMap::new(), Some("alt=sse&key=hunter2")));

        assert!(!is_authorized(&password, &HeaderMap::new(), None));
        assert!(!is_authorized(&password, &HeaderMap::new(), Some("key=wrong")));
    }

    #[test]
    fn query_password_is_percent_decoded() {
        let password = Secret::new("p@ss&w=rd".to_string());
        assert!(is_authorized(
            &password,
            &HeaderMap::new(),
            Some("alt=sse&key=p%40ss%26w%3Drd")
        ));
        assert!(!is_authorized(&password, &HeaderMap::new(), Some("key=p@ss")));
    }

    #[test]
    fn key_query_param_is_stripped() {
        assert_eq!(
            strip_query_param(Some("key=secret&alt=sse"), "key").as_deref(),
            Some("alt=sse")
        );
        assert_eq!(strip_query_param(Some("key=secret"), "key"), None);
        assert_eq!(
            strip_query_param(Some("keyword=x"), "key").as_deref(),
            Some("keyword=x")
        );
        assert_eq!(strip_query_param(None, "key"), None);
    }

    #[test]
    fn model_from_body_or_path() {
        assert_eq!(
            model_name("/v1/chat/completions", &json!({"model": "gemini-1.5-pro"})).as_deref(),
            Some("gemini-1.5-pro")
        );
        assert_eq!(
            model_name("/v1beta/models/gemini-pro:generateContent", &json!({})).as_deref(),
            Some("gemini-pro")
        );
        assert_eq!(model_name("/v1beta/files", &json!({})), None);
    }

    #[test]
    fn buffered_response_drops_hop_by_hop_and_length() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("999"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let response = BufferedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"{}"),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
