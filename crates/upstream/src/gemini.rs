//! Gemini API validation probe
//!
//! Validates a key by listing a single model. The call is cheap, consumes no
//! generation quota, and fails with 400/401/403 for bad keys.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Probe;
use crate::error::ProbeError;

/// Public Gemini API base URL.
pub const DEFAULT_UPSTREAM_URL: &str = "https://generativelanguage.googleapis.com";

/// Header Gemini reads the API key from.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Probe that checks keys against the Gemini models endpoint.
#[derive(Clone)]
pub struct GeminiProbe {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn models_url(&self) -> String {
        format!(
            "{}/v1beta/models?pageSize=1",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Run the probe, keeping the failure reason.
    pub async fn try_check(&self, key: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(self.models_url())
            .header(API_KEY_HEADER, key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(ProbeError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl Probe for GeminiProbe {
    fn id(&self) -> &str {
        "gemini"
    }

    fn check<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.try_check(key).await {
                Ok(()) => {
                    debug!("probe accepted key");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "probe could not confirm key, treating as invalid");
                    false
                }
            }
        })
    }
}
