use std::time::Duration;
use thiserror::Error;

/// Typed failures surfaced to gateway consumers.
///
/// Cloneable so one settled outcome can be handed to every caller that joined
/// the same in-flight request or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Refresh failed terminally; the consumer must re-authenticate.
    #[error("authorization expired; re-authentication required")]
    AuthExpired,

    /// Rate-limit budget exhausted and the key is cooling down.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Persistent 5xx or network failure after bounded retries.
    #[error("upstream unavailable (status {status:?}): {message}")]
    UpstreamUnavailable { status: Option<u16>, message: String },

    /// A single call exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote API returned a payload that could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Non-retryable client error (404, 403, 400 ...).
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("token storage failed: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Transient classes the consumer may surface as a non-blocking notice.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::UpstreamUnavailable { .. }
                | GatewayError::Timeout(_)
        )
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        GatewayError::Storage(format!("{:#}", err))
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
