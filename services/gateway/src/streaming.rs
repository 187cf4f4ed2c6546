//! Streaming support
//!
//! Streaming requests are detected from the Gemini `:streamGenerateContent`
//! method, an `alt=sse` query parameter, or `"stream": true` in the body.
//!
//! With fake streaming, the gateway calls the non-streaming upstream method
//! and holds the client connection open with SSE comment lines until the full
//! response is ready, then sends it as a single `data:` event. Clients on
//! proxies that cut idle connections keep working, and the complete response
//! can be cached like any other.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream;
use serde_json::Value;
use tokio::time::{Instant, Interval, MissedTickBehavior};

const STREAM_METHOD: &str = ":streamGenerateContent";
const UNARY_METHOD: &str = ":generateContent";

/// SSE comment sent while waiting for the upstream response.
const KEEPALIVE: &[u8] = b": keepalive\n\n";

/// Whether the client asked for a streamed response.
pub fn is_streaming_request(path: &str, query: Option<&str>, body: Option<&Value>) -> bool {
    path.ends_with(STREAM_METHOD)
        || query.is_some_and(|q| q.split('&').any(|pair| pair == "alt=sse"))
        || body
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

/// Rewrite a streaming request into its non-streaming equivalent.
///
/// Returns the new path and query; clears a `"stream": true` body flag.
pub fn to_unary(path: &str, query: Option<&str>, body: Option<&mut Value>) -> (String, Option<String>) {
    let path = unary_path(path);
    let query = query
        .map(|q| {
            q.split('&')
                .filter(|pair| *pair != "alt=sse" && !pair.is_empty())
                .collect::<Vec<_>>()
                .join("&")
        })
        .filter(|q| !q.is_empty());
    if let Some(Value::Object(fields)) = body
        && fields.contains_key("stream")
    {
        fields.insert("stream".into(), Value::Bool(false));
    }
    (path, query)
}

/// The non-streaming form of an upstream path. Other paths are unchanged.
pub fn unary_path(path: &str) -> String {
    match path.strip_suffix(STREAM_METHOD) {
        Some(prefix) => format!("{prefix}{UNARY_METHOD}"),
        None => path.to_string(),
    }
}

/// Frame a complete payload as one SSE `data:` event.
///
/// JSON payloads are re-serialized onto a single line; anything else gets
/// one `data:` line per payload line.
pub fn sse_event(payload: &[u8]) -> Bytes {
    match serde_json::from_slice::<Value>(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(_) => {
            let text = String::from_utf8_lossy(payload);
            let mut event = String::with_capacity(text.len() + 16);
            for line in text.lines() {
                event.push_str("data: ");
                event.push_str(line);
                event.push('\n');
            }
            event.push('\n');
            Bytes::from(event)
        }
    }
}

struct FakeStream {
    work: Pin<Box<dyn Future<Output = Bytes> + Send>>,
    ticker: Interval,
    done: bool,
}

/// Build an SSE response that emits keep-alives every `interval` until
/// `work` resolves, then emits its output as the final event.
///
/// `work` must produce the complete event payload, errors included: the
/// 200 status is sent before the outcome is known.
pub fn fake_stream<F>(work: F, interval: Duration) -> Response
where
    F: Future<Output = Bytes> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let state = FakeStream {
        work: Box::pin(work),
        ticker,
        done: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        tokio::select! {
            payload = &mut state.work => {
                state.done = true;
                Some((Ok::<Bytes, Infallible>(sse_event(&payload)), state))
            }
            _ = state.ticker.tick() => Some((Ok(Bytes::from_static(KEEPALIVE)), state)),
        }
    });

    sse_response(Body::from_stream(events))
}

/// Serve an already-complete payload (e.g. a cache hit) as an SSE stream.
pub fn single_event(payload: &[u8]) -> Response {
    sse_response(Body::from(sse_event(payload)))
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}
