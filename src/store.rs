//! Token persistence.
//!
//! The store only has to survive process restarts; it carries no policy. The
//! [`TokenManager`](crate::token::TokenManager) is its single writer.

use crate::db;
use crate::models::TokenState;
use crate::token::RefreshListener;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self) -> Result<Option<TokenState>>;
    async fn set(&self, token: &TokenState) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// SQLite-backed store using the `credentials` table, one row per provider.
pub struct SqliteTokenStore {
    db_path: PathBuf,
    provider: String,
}

impl SqliteTokenStore {
    pub fn new(db_path: PathBuf, provider: impl Into<String>) -> Self {
        Self { db_path, provider: provider.into() }
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self) -> Result<Option<TokenState>> {
        let db_path = self.db_path.clone();
        let provider = self.provider.clone();
        let json_opt = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db::open_or_create(&db_path)?;
            Ok(db::load_credential_with_client(&conn, &provider)?.map(|(json, _, _)| json))
        })
        .await??;

        match json_opt {
            Some(s) => {
                let st: TokenState = serde_json::from_str(&s).map_err(|e| anyhow!("parse token json: {}", e))?;
                Ok(Some(st))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, token: &TokenState) -> Result<()> {
        let db_path = self.db_path.clone();
        let provider = self.provider.clone();
        let s = serde_json::to_string(token)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::save_credential_raw(&conn, &provider, &s, None, None)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::delete_credential(&conn, &provider)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// In-process store; state is lost with the process.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<TokenState>>,
}

impl MemoryTokenStore {
    pub fn new(initial: Option<TokenState>) -> Self {
        Self { token: Mutex::new(initial) }
    }

    /// Current contents without going through the async trait.
    pub fn snapshot(&self) -> Option<TokenState> {
        self.token.lock().map(|g| g.clone()).unwrap_or(None)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self) -> Result<Option<TokenState>> {
        let g = self.token.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        Ok(g.clone())
    }

    async fn set(&self, token: &TokenState) -> Result<()> {
        let mut g = self.token.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *g = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut g = self.token.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *g = None;
        Ok(())
    }
}

/// Records refresh bookkeeping in the `metadata` table. Plugged into the
/// token manager as its user-record synchronizer.
pub struct MetadataRecorder {
    db_path: PathBuf,
}

impl MetadataRecorder {
    pub const LAST_REFRESH_KEY: &'static str = "last_token_refresh";

    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl RefreshListener for MetadataRecorder {
    async fn on_refreshed(&self, token: &TokenState) -> Result<()> {
        let db_path = self.db_path.clone();
        let value = serde_json::json!({
            "refreshed_at": chrono::Utc::now().timestamp(),
            "expires_at": token.expires_at,
            "scope": token.scope,
        })
        .to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::set_metadata(&conn, MetadataRecorder::LAST_REFRESH_KEY, &value)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}
