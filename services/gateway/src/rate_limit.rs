//! Request rate limiting
//!
//! Two independent limits, either disabled by setting it to 0:
//! - a global sliding one-minute window across all clients
//! - a per-client daily counter, reset every 24 hours
//!
//! A request is counted only when it passes both limits.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::time::Instant;
use tracing::warn;

use crate::error::LimitScope;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

struct LimiterState {
    recent: VecDeque<Instant>,
    daily: HashMap<String, u32>,
    day_started: Instant,
}

pub struct RateLimiter {
    per_minute: u32,
    per_day_per_client: u32,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_day_per_client: u32) -> Self {
        Self {
            per_minute,
            per_day_per_client,
            state: Mutex::new(LimiterState {
                recent: VecDeque::new(),
                daily: HashMap::new(),
                day_started: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a request from `client` if both limits allow it.
    pub fn check(&self, client: &str) -> Result<(), LimitScope> {
        let now = Instant::now();
        let mut state = self.lock();

        while state
            .recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE)
        {
            state.recent.pop_front();
        }
        if now.saturating_duration_since(state.day_started) >= DAY {
            state.daily.clear();
            state.day_started = now;
        }

        if self.per_minute > 0 && state.recent.len() >= self.per_minute as usize {
            warn!(limit = self.per_minute, "global request rate limit reached");
            return Err(LimitScope::Global);
        }
        let used = state.daily.get(client).copied().unwrap_or(0);
        if self.per_day_per_client > 0 && used >= self.per_day_per_client {
            warn!(client, limit = self.per_day_per_client, "client daily limit reached");
            return Err(LimitScope::Client);
        }

        if self.per_minute > 0 {
            state.recent.push_back(now);
        }
        if self.per_day_per_client > 0 {
            state.daily.insert(client.to_string(), used + 1);
        }
        Ok(())
    }
}

/// Client address for rate limiting: first `X-Forwarded-For` hop, then the
/// socket peer, then "unknown".
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
