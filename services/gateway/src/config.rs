//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys and the client password come from the environment
//! (`GEMINI_API_KEYS`, `PASSWORD`), never from the TOML file, so secrets stay
//! out of checked-in configuration.

use common::Secret;
use key_pool::{Credential, parse_key_list};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name when neither `--config` nor `CONFIG_PATH` is set.
pub const DEFAULT_CONFIG_FILE: &str = "key-gateway.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub keys: KeysConfig,
    pub cache: CacheConfig,
    pub maintenance: MaintenanceConfig,
    pub streaming: StreamingConfig,
    pub limits: LimitsConfig,
    /// Keys from `GEMINI_API_KEYS`
    #[serde(skip)]
    pub env_keys: Vec<Credential>,
    /// Shared client secret from `PASSWORD`
    #[serde(skip)]
    pub password: Option<Secret<String>>,
}

/// HTTP listener and upstream settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; the admin router is disabled when unset
    pub admin_listen_addr: Option<SocketAddr>,
    pub upstream_url: String,
    pub timeout_secs: u64,
    pub max_connections: usize,
    /// Credentials tried per request before giving up
    pub max_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7860)),
            admin_listen_addr: None,
            upstream_url: upstream::DEFAULT_UPSTREAM_URL.to_string(),
            timeout_secs: 300,
            max_connections: 1000,
            max_attempts: 3,
        }
    }
}

/// Credential settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Persisted key state (configured and known-invalid keys)
    pub settings_path: PathBuf,
    /// Admit every configured key without probing
    pub skip_check: bool,
    /// Pause between probes during background validation
    pub probe_delay_ms: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.json"),
            skip_check: false,
            probe_delay_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub expiry_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 1200,
            max_entries: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    /// In-flight requests older than this are cancelled
    pub max_request_age_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_request_age_secs: 300,
        }
    }
}

/// Fake streaming: call upstream non-streaming and send SSE keep-alives
/// while waiting.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub fake_streaming: bool,
    pub fake_streaming_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            fake_streaming: true,
            fake_streaming_interval_secs: 1,
        }
    }
}

/// Request limits. 0 disables a limit.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_requests_per_minute: u32,
    pub max_requests_per_day_per_ip: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            max_requests_per_day_per_ip: 600,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML contents, then overlay environment variables.
    ///
    /// Every section is optional, so an empty string yields the defaults.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(raw) = std::env::var("GEMINI_API_KEYS") {
            self.env_keys = parse_key_list(&raw);
        }

        if let Ok(password) = std::env::var("PASSWORD") {
            let password = password.trim().to_owned();
            if !password.is_empty() {
                self.password = Some(Secret::new(password));
            }
        }

        if let Ok(raw) = std::env::var("SKIP_CHECK_API_KEY") {
            self.keys.skip_check = parse_bool(&raw).ok_or_else(|| common::Error::Env {
                name: "SKIP_CHECK_API_KEY",
                reason: format!("expected true or false, got {raw:?}"),
            })?;
        }

        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !self.server.upstream_url.starts_with("http://")
            && !self.server.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.server.upstream_url
            )));
        }

        let positive: [(&str, u64); 7] = [
            ("server.timeout_secs", self.server.timeout_secs),
            ("server.max_connections", self.server.max_connections as u64),
            ("server.max_attempts", u64::from(self.server.max_attempts)),
            ("cache.expiry_secs", self.cache.expiry_secs),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("maintenance.interval_secs", self.maintenance.interval_secs),
            (
                "maintenance.max_request_age_secs",
                self.maintenance.max_request_age_secs,
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(common::Error::Config(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.streaming.fake_streaming && self.streaming.fake_streaming_interval_secs == 0 {
            return Err(common::Error::Config(
                "streaming.fake_streaming_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The flag says whether the path was requested explicitly; a missing
    /// default file is not an error.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
