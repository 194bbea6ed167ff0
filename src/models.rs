use serde::{Deserialize, Serialize};

/// OAuth token pair as persisted in the credentials table.
///
/// `expires_at` is always `issued_at + expires_in` in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: i64, // epoch seconds
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl TokenState {
    /// Build a token from a token endpoint response issued at `issued_at`.
    /// Providers may omit `refresh_token` on refresh; the previous one is kept.
    pub fn from_response(resp: TokenResponse, issued_at: i64, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: resp.access_token,
            token_type: resp.token_type.unwrap_or_else(default_token_type),
            expires_at: issued_at + resp.expires_in,
            refresh_token: resp.refresh_token.or(previous_refresh),
            scope: resp.scope,
        }
    }

    /// True while `now < expires_at - buffer_secs`.
    pub fn is_valid_at(&self, now: i64, buffer_secs: i64) -> bool {
        now < self.expires_at - buffer_secs
    }

    /// Seconds left until hard expiry (negative once expired).
    pub fn expires_in_from(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Body returned by the token endpoint for both the code and refresh grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Lifecycle of the authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Valid,
    Refreshing,
}

/// Snapshot of `GET /me/player`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub shuffle_state: bool,
    #[serde(default = "default_repeat_state")]
    pub repeat_state: String,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub item: Option<TrackItem>,
}

fn default_repeat_state() -> String {
    "off".into()
}

impl PlaybackState {
    pub fn track_id(&self) -> Option<&str> {
        self.item.as_ref().and_then(|i| i.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub volume_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackItem {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub name: String,
}

/// `GET /me`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
}

/// One page of a Web API paging object.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}
