use super::Method;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::{request_key, CallOptions, Gateway};
use crate::models::{Page, PlaybackState, PlaylistSummary, UserProfile};
use crate::poller::{FetchMode, Fetcher, PollPolicy};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const PLAYER_PATH: &str = "/me/player";

/// Playlist track writes accept at most this many URIs per request.
const MAX_BATCH: usize = 100;

/// Typed helpers over the Web API. Every call goes through the gateway, so
/// these inherit its caching, deduplication and retry policy.
#[derive(Clone)]
pub struct SpotifyApi {
    gateway: Gateway,
    api_base: String,
}

impl SpotifyApi {
    /// `api_base` is used to turn absolute `next` links back into gateway paths.
    pub fn new(gateway: Gateway, api_base: impl Into<String>) -> Self {
        Self {
            gateway,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(Gateway::from_config(cfg), cfg.api_base.clone())
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn current_user(&self) -> Result<UserProfile> {
        self.gateway.get_json("/me", CallOptions::default()).await
    }

    /// `None` when nothing is playing (the API answers 204).
    pub async fn playback_state(&self, mode: FetchMode) -> Result<Option<PlaybackState>> {
        let value = match mode {
            FetchMode::Cached => self.gateway.get(PLAYER_PATH).await?,
            FetchMode::Fresh => self.gateway.get_fresh(PLAYER_PATH).await?,
        };
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| GatewayError::InvalidResponse(format!("{}: {}", PLAYER_PATH, e)))
    }

    /// Fetcher for `PollScheduler::start_polling`.
    pub fn playback_fetcher(&self) -> Fetcher<Option<PlaybackState>> {
        let api = self.clone();
        Arc::new(move |mode: FetchMode| {
            let api = api.clone();
            async move { api.playback_state(mode).await }.boxed()
        })
    }

    /// Polling policy for the player resource, following its gateway retry state.
    pub fn playback_policy(cfg: &Config) -> PollPolicy {
        PollPolicy::from_config(cfg, Some(request_key(Method::Get, PLAYER_PATH)))
    }

    pub async fn pause(&self) -> Result<()> {
        self.gateway.put("/me/player/pause", Value::Null).await.map(|_| ())
    }

    pub async fn resume(&self) -> Result<()> {
        self.gateway.put("/me/player/play", Value::Null).await.map(|_| ())
    }

    pub async fn skip_next(&self) -> Result<()> {
        self.gateway.post("/me/player/next", Value::Null).await.map(|_| ())
    }

    /// All playlists of the current user, following `next` links.
    pub async fn user_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let mut playlists = Vec::new();
        let mut next = Some("/me/playlists?limit=50".to_string());
        while let Some(path) = next {
            let page: Page<PlaylistSummary> = self.gateway.get_json(&path, CallOptions::default()).await?;
            playlists.extend(page.items);
            next = page.next.map(|n| self.relative(&n));
        }
        Ok(playlists)
    }

    /// Track URIs of a playlist in order, duplicates removed.
    pub async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<String>> {
        let mut uris = Vec::new();
        let mut next = Some(format!(
            "/playlists/{}/tracks?fields=items(track(uri)),next&limit=100",
            urlencoding::encode(playlist_id)
        ));
        while let Some(path) = next {
            let j = self.gateway.get(&path).await?;
            if let Some(items) = j["items"].as_array() {
                uris.extend(items.iter().filter_map(|it| it["track"]["uri"].as_str().map(String::from)));
            }
            next = j["next"].as_str().map(|n| self.relative(n));
        }
        let mut seen = HashSet::new();
        uris.retain(|u| seen.insert(u.clone()));
        Ok(uris)
    }

    /// Create a private playlist for the current user and return its id.
    pub async fn create_playlist(&self, name: &str, description: &str) -> Result<String> {
        let user = self.current_user().await?;
        let path = format!("/users/{}/playlists", urlencoding::encode(&user.id));
        let body = json!({ "name": name, "description": description, "public": false });
        let j = self.gateway.post(&path, body).await?;
        j["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::InvalidResponse("create playlist: no id in response".into()))
    }

    pub async fn rename_playlist(&self, playlist_id: &str, new_name: &str) -> Result<()> {
        let path = format!("/playlists/{}", urlencoding::encode(playlist_id));
        self.gateway.put(&path, json!({ "name": new_name })).await.map(|_| ())
    }

    pub async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        let path = format!("/playlists/{}/tracks", urlencoding::encode(playlist_id));
        for chunk in uris.chunks(MAX_BATCH) {
            debug!(playlist_id, count = chunk.len(), "adding tracks");
            self.gateway.post(&path, json!({ "uris": chunk })).await?;
        }
        Ok(())
    }

    pub async fn remove_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        let path = format!("/playlists/{}/tracks", urlencoding::encode(playlist_id));
        for chunk in uris.chunks(MAX_BATCH) {
            let tracks: Vec<Value> = chunk.iter().map(|u| json!({ "uri": u })).collect();
            debug!(playlist_id, count = chunk.len(), "removing tracks");
            self.gateway.delete_with_body(&path, json!({ "tracks": tracks })).await?;
        }
        Ok(())
    }

    /// First track matching title and artist.
    pub async fn search_track_uri(&self, title: &str, artist: &str) -> Result<Option<String>> {
        let q = format!("track:{} artist:{}", title, artist);
        let path = format!("/search?q={}&type=track&limit=1", urlencoding::encode(&q));
        let j = self.gateway.get(&path).await?;
        Ok(j["tracks"]["items"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|first| first["uri"].as_str())
            .map(String::from))
    }

    fn relative(&self, link: &str) -> String {
        link.strip_prefix(&self.api_base).unwrap_or(link).to_string()
    }
}
