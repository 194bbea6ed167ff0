use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Remote endpoints
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_auth_base")]
    pub auth_base: String,

    // Client credentials are supplied out of band; SPOTIFY_CLIENT_ID /
    // SPOTIFY_CLIENT_SECRET override these when set.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    // path to database file holding tokens and metadata
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    // Token lifecycle
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,
    #[serde(default = "default_refresh_max_retries")]
    pub refresh_max_retries: u32,

    // Gateway
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Per-resource TTL overrides; the longest matching path prefix wins.
    #[serde(default = "default_cache_ttl_rules")]
    pub cache_ttl: Vec<CacheTtlRule>,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_rate_limit_default_delay")]
    pub rate_limit_default_delay_secs: u64,
    #[serde(default = "default_rate_limit_max_delay")]
    pub rate_limit_max_delay_secs: u64,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_server_max_retries")]
    pub server_max_retries: u32,
    #[serde(default = "default_server_backoff_base")]
    pub server_backoff_base_ms: u64,
    #[serde(default = "default_server_backoff_max")]
    pub server_backoff_max_ms: u64,

    // Polling
    #[serde(default = "default_poll_active")]
    pub poll_active_secs: u64,
    #[serde(default = "default_poll_idle")]
    pub poll_idle_secs: u64,
    #[serde(default = "default_poll_max_backoff")]
    pub poll_max_backoff_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheTtlRule {
    pub prefix: String,
    pub secs: u64,
}

fn default_api_base() -> String { "https://api.spotify.com/v1".into() }
fn default_auth_base() -> String { "https://accounts.spotify.com".into() }
fn default_redirect_uri() -> String { "http://127.0.0.1:8888/callback".into() }
fn default_scopes() -> Vec<String> {
    vec![
        "user-read-playback-state",
        "user-read-currently-playing",
        "user-modify-playback-state",
        "playlist-read-private",
        "playlist-modify-private",
        "playlist-modify-public",
        "user-read-private",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("playback-gateway").join("gateway.db"))
        .unwrap_or_else(|| "playback-gateway.db".into())
}
fn default_log_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("playback-gateway"))
        .unwrap_or_else(|| "log".into())
}
/// Lifetime of the provider's access tokens.
const MAX_REFRESH_BUFFER_SECS: u64 = 3600;

fn default_refresh_buffer() -> u64 { 300 }
fn default_refresh_max_retries() -> u32 { 3 }
fn default_request_timeout() -> u64 { 10_000 }
fn default_cache_ttl() -> u64 { 30 }
fn default_cache_ttl_rules() -> Vec<CacheTtlRule> {
    vec![
        CacheTtlRule { prefix: "/me/player".into(), secs: 3 },
        CacheTtlRule { prefix: "/search".into(), secs: 10 },
    ]
}
fn default_rate_limit_max_retries() -> u32 { 3 }
fn default_rate_limit_default_delay() -> u64 { 1 }
fn default_rate_limit_max_delay() -> u64 { 60 }
fn default_rate_limit_cooldown() -> u64 { 60 }
fn default_server_max_retries() -> u32 { 3 }
fn default_server_backoff_base() -> u64 { 500 }
fn default_server_backoff_max() -> u64 { 8_000 }
fn default_poll_active() -> u64 { 5 }
fn default_poll_idle() -> u64 { 30 }
fn default_poll_max_backoff() -> u64 { 120 }

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            auth_base: default_auth_base(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            refresh_buffer_secs: default_refresh_buffer(),
            refresh_max_retries: default_refresh_max_retries(),
            request_timeout_ms: default_request_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            cache_ttl: default_cache_ttl_rules(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            rate_limit_default_delay_secs: default_rate_limit_default_delay(),
            rate_limit_max_delay_secs: default_rate_limit_max_delay(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            server_max_retries: default_server_max_retries(),
            server_backoff_base_ms: default_server_backoff_base(),
            server_backoff_max_ms: default_server_backoff_max(),
            poll_active_secs: default_poll_active(),
            poll_idle_secs: default_poll_idle(),
            poll_max_backoff_secs: default_poll_max_backoff(),
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg.with_env_credentials())
    }

    /// Apply SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET when present.
    pub fn with_env_credentials(mut self) -> Self {
        if let Ok(id) = std::env::var("SPOTIFY_CLIENT_ID") {
            if !id.is_empty() {
                self.client_id = id;
            }
        }
        if let Ok(secret) = std::env::var("SPOTIFY_CLIENT_SECRET") {
            if !secret.is_empty() {
                self.client_secret = Some(secret);
            }
        }
        self
    }

    /// Reject settings that would make the gateway misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base).map_err(|e| anyhow!("invalid api_base {}: {}", self.api_base, e))?;
        url::Url::parse(&self.auth_base).map_err(|e| anyhow!("invalid auth_base {}: {}", self.auth_base, e))?;
        if let Some(rule) = self.cache_ttl.iter().find(|r| !r.prefix.starts_with('/')) {
            return Err(anyhow!("cache_ttl prefix must start with '/': {}", rule.prefix));
        }
        if self.refresh_buffer_secs >= MAX_REFRESH_BUFFER_SECS {
            return Err(anyhow!(
                "refresh_buffer_secs ({}) must be below the {} s access token lifetime",
                self.refresh_buffer_secs,
                MAX_REFRESH_BUFFER_SECS
            ));
        }
        if self.rate_limit_max_retries == 0 {
            return Err(anyhow!("rate_limit_max_retries must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(anyhow!("request_timeout_ms must be positive"));
        }
        if self.poll_active_secs == 0 || self.poll_active_secs > self.poll_idle_secs {
            return Err(anyhow!(
                "poll_active_secs ({}) must be positive and not exceed poll_idle_secs ({})",
                self.poll_active_secs,
                self.poll_idle_secs
            ));
        }
        Ok(())
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
