pub mod http;
pub mod mock;
pub mod pkce;
pub mod spotify;
pub mod spotify_auth;

use crate::models::TokenResponse;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Only reads are cacheable; everything else invalidates.
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatch against the remote API. `path` is relative to the API base.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` header.
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, retry_after: None, body: body.into() }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transport deadline exceeded")]
    Timeout,
}

/// Wire seam for the request gateway. `http::ReqwestTransport` talks to the
/// real API; `mock::MockTransport` replays scripted responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    /// The token endpoint refused the grant (invalid_grant, invalid_client ...).
    #[error("token endpoint rejected refresh ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Network failure, 5xx or 429; worth retrying.
    #[error("transient token endpoint failure: {0}")]
    Transient(String),
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ExchangeError>;
}

/// Parse a `Retry-After` header value: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
