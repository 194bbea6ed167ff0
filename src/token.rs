//! Token lifecycle: the single authoritative in-memory view of the access
//! token, single-flight refresh and the proactive refresh timer.
//!
//! State machine:
//!
//! ```text
//! Unauthenticated -> Authenticating -> Valid -> Refreshing -> Valid
//!                                               Refreshing -> Unauthenticated (permanent failure)
//!                                      Valid -> Unauthenticated (logout)
//! ```

use crate::api::{ExchangeError, TokenExchanger};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::models::{AuthState, TokenResponse, TokenState};
use crate::store::TokenStore;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenState>>>;

/// Floor for the proactive timer, so very short-lived tokens cannot spin it.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Collaborator told about every successful refresh (e.g. a user-record
/// synchronizer). Its failures are logged and never fail the refresh.
#[async_trait]
pub trait RefreshListener: Send + Sync {
    async fn on_refreshed(&self, token: &TokenState) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// Tokens count as invalid this long before their hard expiry.
    pub refresh_buffer: Duration,
    /// Retries for transient token endpoint failures before giving up.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Deadline for one token endpoint exchange.
    pub exchange_timeout: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(300),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

impl TokenSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            refresh_buffer: cfg.refresh_buffer(),
            max_retries: cfg.refresh_max_retries,
            exchange_timeout: cfg.request_timeout(),
            ..Self::default()
        }
    }
}

struct Session {
    token: Option<TokenState>,
    /// Issued lifetime of the held token, when known. Caps the refresh buffer.
    lifetime: Option<Duration>,
    /// Set once the store has been consulted.
    loaded: bool,
    /// The held access token was rejected upstream; refresh before reuse.
    stale: bool,
    auth: AuthState,
    pending: Option<(u64, SharedRefresh)>,
    next_flight: u64,
    /// Bumped on logout so a refresh that started earlier cannot resurrect state.
    generation: u64,
    timer: Option<CancellationToken>,
}

struct Inner {
    store: Arc<dyn TokenStore>,
    exchanger: Arc<dyn TokenExchanger>,
    listener: Option<Arc<dyn RefreshListener>>,
    settings: TokenSettings,
    session: Mutex<Session>,
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, exchanger: Arc<dyn TokenExchanger>, settings: TokenSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchanger,
                listener: None,
                settings,
                session: Mutex::new(Session {
                    token: None,
                    lifetime: None,
                    loaded: false,
                    stale: false,
                    auth: AuthState::Unauthenticated,
                    pending: None,
                    next_flight: 0,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Attach the refresh listener. Must be called before the manager is cloned.
    pub fn with_listener(mut self, listener: Arc<dyn RefreshListener>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.listener = Some(listener),
            None => warn!("refresh listener ignored: token manager already shared"),
        }
        self
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> AuthState {
        self.inner.lock().auth
    }

    /// The held token regardless of validity.
    pub fn current_token(&self) -> Option<TokenState> {
        self.inner.lock().token.clone()
    }

    /// Returns a token valid for immediate use. No network I/O when the held
    /// token is valid; otherwise triggers or joins the refresh in progress.
    pub async fn get_valid_token(&self) -> Result<TokenState> {
        self.ensure_loaded().await?;
        if let Some(token) = self.inner.valid_token() {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Exchange the refresh token for a new pair. Concurrent callers share one
    /// exchange and receive the same outcome.
    pub async fn refresh(&self) -> Result<TokenState> {
        self.ensure_loaded().await?;
        let flight = Inner::join_or_start_refresh(&self.inner);
        flight.await
    }

    /// Recover after the API rejected `rejected_access_token` with 401.
    ///
    /// If another caller already replaced that token the fresh one is
    /// returned; otherwise the token is marked stale and a refresh is joined.
    pub async fn recover_unauthorized(&self, rejected_access_token: &str) -> Result<TokenState> {
        {
            let mut s = self.inner.lock();
            let buffer = self.inner.buffer_secs(&s);
            let stale = s.stale;
            let replaced = s
                .token
                .as_ref()
                .filter(|t| !stale && t.access_token != rejected_access_token && t.is_valid_at(now(), buffer))
                .cloned();
            if let Some(token) = replaced {
                return Ok(token);
            }
            if s.token.is_some() {
                s.stale = true;
            }
        }
        self.refresh().await
    }

    /// Mark the held token unusable if it is still `access_token`.
    pub fn invalidate(&self, access_token: &str) {
        let mut s = self.inner.lock();
        if s.token.as_ref().map(|t| t.access_token.as_str()) == Some(access_token) {
            s.stale = true;
        }
    }

    /// Drop all token state after an irrecoverable 401.
    pub async fn expire(&self) {
        let generation = self.inner.lock().generation;
        warn!("access rejected after refresh; clearing token state");
        self.inner.fail(generation).await;
    }

    /// Arm the proactive refresh to fire `refresh_buffer` before `expires_in`
    /// elapses, but never sooner than `MIN_REFRESH_DELAY` from now. Replaces
    /// any previously armed timer.
    pub fn schedule_proactive_refresh(&self, expires_in: Duration) {
        let mut s = self.inner.lock();
        Inner::arm_timer(&self.inner, &mut s, expires_in);
    }

    /// Mark the start of an interactive authorization.
    pub fn begin_authorization(&self) {
        let mut s = self.inner.lock();
        if s.auth == AuthState::Unauthenticated {
            s.auth = AuthState::Authenticating;
        }
    }

    pub fn abort_authorization(&self) {
        let mut s = self.inner.lock();
        if s.auth == AuthState::Authenticating {
            s.auth = AuthState::Unauthenticated;
        }
    }

    /// Install a token obtained from the authorization flow.
    pub async fn set_token(&self, token: TokenState) -> Result<()> {
        {
            let mut s = self.inner.lock();
            s.generation += 1;
            let expires_in = secs_to_duration(token.expires_in_from(now()));
            s.token = Some(token.clone());
            s.lifetime = Some(expires_in);
            s.loaded = true;
            s.stale = false;
            s.auth = AuthState::Valid;
            Inner::arm_timer(&self.inner, &mut s, expires_in);
        }
        self.inner.store.set(&token).await.map_err(GatewayError::storage)?;
        info!(expires_at = token.expires_at, "token installed");
        Ok(())
    }

    /// Clear memory and store and cancel the proactive timer.
    pub async fn logout(&self) -> Result<()> {
        {
            let mut s = self.inner.lock();
            s.generation += 1;
            s.token = None;
            s.lifetime = None;
            s.stale = false;
            s.loaded = true;
            s.pending = None;
            s.auth = AuthState::Unauthenticated;
            if let Some(timer) = s.timer.take() {
                timer.cancel();
            }
        }
        self.inner.store.clear().await.map_err(GatewayError::storage)?;
        info!("logged out; token state cleared");
        Ok(())
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if self.inner.lock().loaded {
            return Ok(());
        }
        let stored = self.inner.store.get().await.map_err(GatewayError::storage)?;
        let mut s = self.inner.lock();
        if s.loaded {
            // a refresh or set_token won the race
            return Ok(());
        }
        s.loaded = true;
        if let Some(token) = stored {
            debug!(expires_at = token.expires_at, "loaded token from store");
            let expires_in = secs_to_duration(token.expires_in_from(now()));
            s.token = Some(token);
            s.auth = AuthState::Valid;
            Inner::arm_timer(&self.inner, &mut s, expires_in);
        }
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The configured buffer, capped at half the held token's issued lifetime.
    fn effective_buffer(&self, s: &Session) -> Duration {
        match s.lifetime {
            Some(lifetime) => self.settings.refresh_buffer.min(lifetime / 2),
            None => self.settings.refresh_buffer,
        }
    }

    fn buffer_secs(&self, s: &Session) -> i64 {
        self.effective_buffer(s).as_secs() as i64
    }

    fn valid_token(&self) -> Option<TokenState> {
        let s = self.lock();
        if s.stale {
            return None;
        }
        let buffer = self.buffer_secs(&s);
        s.token.as_ref().filter(|t| t.is_valid_at(now(), buffer)).cloned()
    }

    fn join_or_start_refresh(this: &Arc<Inner>) -> SharedRefresh {
        let mut s = this.lock();
        if let Some((_, flight)) = &s.pending {
            return flight.clone();
        }
        let id = s.next_flight;
        s.next_flight += 1;
        let generation = s.generation;
        if s.token.is_some() {
            s.auth = AuthState::Refreshing;
        }
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move { Inner::run_refresh(inner, id, generation).await });
        let flight = async move {
            match handle.await {
                Ok(res) => res,
                Err(e) => Err(GatewayError::UpstreamUnavailable {
                    status: None,
                    message: format!("refresh task failed: {}", e),
                }),
            }
        }
        .boxed()
        .shared();
        s.pending = Some((id, flight.clone()));
        flight
    }

    async fn run_refresh(this: Arc<Inner>, id: u64, generation: u64) -> Result<TokenState> {
        let refresh_token = this.lock().token.as_ref().and_then(|t| t.refresh_token.clone());
        let outcome = match &refresh_token {
            Some(rt) => this.exchange_with_retries(rt).await,
            None => {
                warn!("no refresh token available; re-authentication required");
                Err(GatewayError::AuthExpired)
            }
        };

        let result = match outcome {
            Ok(resp) => this.commit(resp, refresh_token, generation).await,
            Err(e) => {
                this.fail(generation).await;
                Err(e)
            }
        };

        let mut s = this.lock();
        if matches!(&s.pending, Some((pending_id, _)) if *pending_id == id) {
            s.pending = None;
        }
        result
    }

    async fn exchange_with_retries(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut backoff = self.settings.retry_base;
        for attempt in 0..=self.settings.max_retries {
            let exchange = tokio::time::timeout(self.settings.exchange_timeout, self.exchanger.refresh(refresh_token)).await;
            let err = match exchange {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(ExchangeError::Rejected { status, message })) => {
                    warn!(status, %message, "refresh token rejected");
                    return Err(GatewayError::AuthExpired);
                }
                Ok(Err(ExchangeError::Transient(msg))) => msg,
                Err(_) => "token exchange timed out".to_string(),
            };
            if attempt == self.settings.max_retries {
                warn!(attempts = attempt + 1, err = %err, "token refresh exhausted retries");
                break;
            }
            debug!(attempt, err = %err, "refresh attempt failed, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.settings.retry_max);
        }
        Err(GatewayError::AuthExpired)
    }

    async fn commit(self: &Arc<Self>, resp: TokenResponse, previous_refresh: Option<String>, generation: u64) -> Result<TokenState> {
        let lifetime = secs_to_duration(resp.expires_in);
        let token = TokenState::from_response(resp, now(), previous_refresh);
        {
            let mut s = self.lock();
            if s.generation != generation {
                // logout or set_token happened mid-flight; their state wins
                debug!("discarding superseded refresh result");
                let buffer = self.buffer_secs(&s);
                return s
                    .token
                    .as_ref()
                    .filter(|t| t.is_valid_at(now(), buffer))
                    .cloned()
                    .ok_or(GatewayError::AuthExpired);
            }
            s.token = Some(token.clone());
            s.lifetime = Some(lifetime);
            s.stale = false;
            s.auth = AuthState::Valid;
            let expires_in = secs_to_duration(token.expires_in_from(now()));
            Inner::arm_timer(self, &mut s, expires_in);
        }
        info!(expires_at = token.expires_at, "access token refreshed");

        if let Err(e) = self.store.set(&token).await {
            warn!(err = %e, "failed to persist refreshed token");
        }
        if let Some(listener) = self.listener.clone() {
            let t = token.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.on_refreshed(&t).await {
                    warn!(err = %e, "refresh listener failed");
                }
            });
        }
        Ok(token)
    }

    async fn fail(&self, generation: u64) {
        {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            s.token = None;
            s.lifetime = None;
            s.stale = false;
            s.auth = AuthState::Unauthenticated;
            if let Some(timer) = s.timer.take() {
                timer.cancel();
            }
        }
        if let Err(e) = self.store.clear().await {
            warn!(err = %e, "failed to clear token store after refresh failure");
        }
    }

    fn arm_timer(this: &Arc<Inner>, s: &mut Session, expires_in: Duration) {
        if let Some(previous) = s.timer.take() {
            previous.cancel();
        }
        let delay = expires_in
            .saturating_sub(this.effective_buffer(s))
            .max(MIN_REFRESH_DELAY);
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let weak: Weak<Inner> = Arc::downgrade(this);
        debug!(delay_secs = delay.as_secs(), "proactive refresh armed");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            debug!("proactive refresh timer fired");
            let manager = TokenManager { inner };
            if let Err(e) = manager.refresh().await {
                warn!(err = %e, "proactive refresh failed");
            }
        });
        s.timer = Some(cancel);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn secs_to_duration(secs: i64) -> Duration {
    Duration::from_secs(secs.max(0) as u64)
}
