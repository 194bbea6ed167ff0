//! Request gateway: the single entry point for remote API calls.
//!
//! Every call is keyed `METHOD:path`. Per key there is at most one network
//! call in flight; concurrent callers join it and observe the same outcome.
//! A write whose body differs from the one in flight is queued behind it.
//! GET results are cached for a short, per-resource TTL and writes invalidate
//! the reads they affect. 401, 429, 5xx and network failures are handled here
//! once, with one retry policy for every endpoint.

use crate::api::http::ReqwestTransport;
use crate::api::spotify_auth::SpotifyTokenEndpoint;
use crate::api::{ApiRequest, ApiResponse, Method, Transport, TransportError};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::store::{MetadataRecorder, SqliteTokenStore};
use crate::token::{TokenManager, TokenSettings};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SharedCall = Shared<BoxFuture<'static, Result<Value>>>;

/// Provider row used for the token store.
pub const PROVIDER: &str = "spotify";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    pub default_ttl: Duration,
    /// `(path prefix, ttl)`; the longest matching prefix wins.
    pub ttl_rules: Vec<(String, Duration)>,
    pub rate_limit_max_retries: u32,
    /// Used when a 429 carries no Retry-After.
    pub rate_limit_default_delay: Duration,
    pub rate_limit_max_delay: Duration,
    pub rate_limit_cooldown: Duration,
    pub server_max_retries: u32,
    pub server_backoff_base: Duration,
    pub server_backoff_max: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl GatewaySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            request_timeout: cfg.request_timeout(),
            default_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            ttl_rules: cfg
                .cache_ttl
                .iter()
                .map(|r| (r.prefix.clone(), Duration::from_secs(r.secs)))
                .collect(),
            rate_limit_max_retries: cfg.rate_limit_max_retries,
            rate_limit_default_delay: Duration::from_secs(cfg.rate_limit_default_delay_secs),
            rate_limit_max_delay: Duration::from_secs(cfg.rate_limit_max_delay_secs),
            rate_limit_cooldown: Duration::from_secs(cfg.rate_limit_cooldown_secs),
            server_max_retries: cfg.server_max_retries,
            server_backoff_base: Duration::from_millis(cfg.server_backoff_base_ms),
            server_backoff_max: Duration::from_millis(cfg.server_backoff_max_ms),
        }
    }

    /// Cache TTL for a request path (query string ignored).
    pub fn ttl_for(&self, path: &str) -> Duration {
        let path = resource_path(path);
        self.ttl_rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }

    fn server_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.server_backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.server_backoff_max)
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Skip the cache lookup (the result still refreshes the cache).
    pub bypass_cache: bool,
    /// Override the configured TTL for this read.
    pub ttl: Option<Duration>,
}

impl CallOptions {
    pub fn fresh() -> Self {
        Self { bypass_cache: true, ttl: None }
    }
}

/// Read-only view of a key's retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySnapshot {
    /// Consecutive 429 responses.
    pub rate_limited: u32,
    /// Consecutive failed calls of any kind.
    pub failures: u32,
    /// Backoff computed for the latest failure.
    pub backoff: Duration,
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug, Default)]
struct RetryState {
    rate_limited: u32,
    failures: u32,
    rate_delay: Duration,
    backoff: Duration,
    cooldown_until: Option<Instant>,
    updated_at: Option<Instant>,
}

struct CacheEntry {
    path: String,
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

struct InFlight {
    id: u64,
    method: Method,
    path: String,
    issued_at: Instant,
    result: SharedCall,
}

#[derive(Default)]
struct Tables {
    in_flight: HashMap<String, InFlight>,
    /// Latest write dispatched per `METHOD:path`; a write with a different
    /// body waits for it so the key never has two calls on the wire.
    write_tails: HashMap<String, (u64, SharedCall)>,
    cache: HashMap<String, CacheEntry>,
    retry: HashMap<String, RetryState>,
    /// Reads overtaken by a write; their results must not be cached.
    detached: HashSet<u64>,
    next_id: u64,
}

impl Tables {
    /// Remaining cool-down for `key`. An expired cool-down resets the 429 budget.
    fn cooldown_remaining(&mut self, key: &str, now: Instant) -> Option<Duration> {
        let state = self.retry.get_mut(key)?;
        match state.cooldown_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                debug!(key, "cool-down elapsed; rate limit budget reset");
                state.cooldown_until = None;
                state.rate_limited = 0;
                state.rate_delay = Duration::ZERO;
                None
            }
            None => None,
        }
    }

    /// Drop expired cache entries and retry state nobody has touched for
    /// `retention` unless the key is still cooling down.
    fn prune(&mut self, now: Instant, retention: Duration) {
        self.cache.retain(|_, e| now.duration_since(e.stored_at) < e.ttl);
        self.retry.retain(|_, r| {
            let cooling = matches!(r.cooldown_until, Some(until) if until > now);
            let recent = matches!(r.updated_at, Some(at) if now.duration_since(at) < retention);
            cooling || recent
        });
    }

    /// Drop cached reads affected by a write to `write_path` and detach any
    /// matching reads still in flight so later callers start fresh.
    fn invalidate_affected(&mut self, write_path: &str) {
        let target = resource_path(write_path);
        let before = self.cache.len();
        self.cache.retain(|_, e| !paths_overlap(target, resource_path(&e.path)));
        let dropped = before - self.cache.len();

        let stale: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.method.is_read() && paths_overlap(target, resource_path(&f.path)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(f) = self.in_flight.remove(&key) {
                self.detached.insert(f.id);
            }
        }
        if dropped > 0 {
            debug!(path = target, dropped, "invalidated cached reads");
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
    settings: GatewaySettings,
    tables: Mutex<Tables>,
}

/// Cheap to clone; clones share caches and in-flight state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, tokens: TokenManager, settings: GatewaySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                tokens,
                settings,
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    /// Wire the production stack: reqwest transport, SQLite token store,
    /// accounts token endpoint and refresh bookkeeping in the metadata table.
    pub fn from_config(cfg: &Config) -> Self {
        let store = Arc::new(SqliteTokenStore::new(cfg.db_path.clone(), PROVIDER));
        let exchanger = Arc::new(SpotifyTokenEndpoint::from_config(cfg));
        let tokens = TokenManager::new(store, exchanger, TokenSettings::from_config(cfg))
            .with_listener(Arc::new(MetadataRecorder::new(cfg.db_path.clone())));
        let transport = Arc::new(ReqwestTransport::new(cfg.api_base.clone()));
        Self::new(transport, tokens, GatewaySettings::from_config(cfg))
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.execute(Method::Get, path, None, CallOptions::default()).await
    }

    /// GET that ignores any cached value.
    pub async fn get_fresh(&self, path: &str) -> Result<Value> {
        self.execute(Method::Get, path, None, CallOptions::fresh()).await
    }

    /// GET decoded into `T`; decode failures surface as `InvalidResponse`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, opts: CallOptions) -> Result<T> {
        let value = self.execute(Method::Get, path, None, opts).await?;
        serde_json::from_value(value).map_err(|e| GatewayError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.execute(Method::Post, path, body_opt(body), CallOptions::default()).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value> {
        self.execute(Method::Put, path, body_opt(body), CallOptions::default()).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.execute(Method::Delete, path, None, CallOptions::default()).await
    }

    pub async fn delete_with_body(&self, path: &str, body: Value) -> Result<Value> {
        self.execute(Method::Delete, path, body_opt(body), CallOptions::default()).await
    }

    /// Run one logical call through cache, cool-down, deduplication and the
    /// retry policy.
    pub async fn execute(&self, method: Method, path: &str, body: Option<Value>, opts: CallOptions) -> Result<Value> {
        let key = request_key(method, path);
        let flight_key = dedup_key(method, path, body.as_ref());
        let flight = {
            let mut t = self.inner.lock();
            let now = Instant::now();
            if method.is_read() && !opts.bypass_cache {
                let cached = t
                    .cache
                    .get(&key)
                    .map(|e| (now.duration_since(e.stored_at) < e.ttl, e.value.clone()));
                match cached {
                    Some((true, value)) => {
                        debug!(key = %key, "cache hit");
                        return Ok(value);
                    }
                    Some((false, _)) => {
                        t.cache.remove(&key);
                    }
                    None => {}
                }
            }
            if let Some(remaining) = t.cooldown_remaining(&key, now) {
                debug!(key = %key, remaining_ms = remaining.as_millis() as u64, "key cooling down; failing fast");
                return Err(GatewayError::RateLimited { retry_after: remaining });
            }
            let joined = t
                .in_flight
                .get(&flight_key)
                .map(|f| (f.result.clone(), now.duration_since(f.issued_at)));
            match joined {
                Some((result, age)) => {
                    debug!(key = %key, age_ms = age.as_millis() as u64, "joining in-flight request");
                    result
                }
                None => {
                    let predecessor = if method.is_read() {
                        None
                    } else {
                        t.invalidate_affected(path);
                        t.write_tails.get(&key).map(|(_, f)| f.clone())
                    };
                    if predecessor.is_some() {
                        debug!(key = %key, "queueing write behind the one in flight");
                    }
                    let id = t.next_id;
                    t.next_id += 1;
                    let inner = Arc::clone(&self.inner);
                    let owned_path = path.to_string();
                    let call_key = flight_key.clone();
                    let handle = tokio::spawn(async move {
                        if let Some(previous) = predecessor {
                            // only ordering matters; its caller gets the outcome
                            let _ = previous.await;
                        }
                        Inner::run_call(inner, id, call_key, method, owned_path, body, opts).await
                    });
                    let result = async move {
                        match handle.await {
                            Ok(res) => res,
                            Err(e) => Err(GatewayError::UpstreamUnavailable {
                                status: None,
                                message: format!("request task failed: {}", e),
                            }),
                        }
                    }
                    .boxed()
                    .shared();
                    t.in_flight.insert(
                        flight_key.clone(),
                        InFlight { id, method, path: path.to_string(), issued_at: now, result: result.clone() },
                    );
                    if !method.is_read() {
                        t.write_tails.insert(key.clone(), (id, result.clone()));
                    }
                    result
                }
            }
        };
        flight.await
    }

    /// Retry bookkeeping for a `METHOD:path` key, if any failures are recorded.
    pub fn retry_state(&self, key: &str) -> Option<RetrySnapshot> {
        let mut t = self.inner.lock();
        let now = Instant::now();
        let cooldown_remaining = t.cooldown_remaining(key, now);
        t.retry.get(key).map(|s| RetrySnapshot {
            rate_limited: s.rate_limited,
            failures: s.failures,
            backoff: s.backoff,
            cooldown_remaining,
        })
    }

    /// Drop cached reads affected by `path` as if it had been written.
    pub fn invalidate_cache(&self, path: &str) {
        self.inner.lock().invalidate_affected(path);
    }

    pub fn clear_cache(&self) {
        self.inner.lock().cache.clear();
    }

    /// Number of cached reads, fresh or not yet pruned.
    pub fn cached_count(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Number of keys with retry bookkeeping.
    pub fn tracked_retry_keys(&self) -> usize {
        self.inner.lock().retry.len()
    }

    /// Number of keys with a network call currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_call(
        this: Arc<Inner>,
        id: u64,
        flight_key: String,
        method: Method,
        path: String,
        body: Option<Value>,
        opts: CallOptions,
    ) -> Result<Value> {
        let key = request_key(method, &path);
        let result = this.dispatch(&key, method, &path, body).await;

        let mut t = this.lock();
        let now = Instant::now();
        if matches!(t.in_flight.get(&flight_key), Some(f) if f.id == id) {
            t.in_flight.remove(&flight_key);
        }
        if matches!(t.write_tails.get(&key), Some((tail, _)) if *tail == id) {
            t.write_tails.remove(&key);
        }
        let detached = t.detached.remove(&id);
        t.prune(now, this.settings.rate_limit_cooldown);
        if method.is_read() {
            if let (Ok(value), false) = (&result, detached) {
                let ttl = opts.ttl.unwrap_or_else(|| this.settings.ttl_for(&path));
                t.cache.insert(
                    key.clone(),
                    CacheEntry { path: path.clone(), value: value.clone(), stored_at: now, ttl },
                );
            }
        } else {
            t.invalidate_affected(&path);
        }
        drop(t);
        result
    }

    /// The retry loop for one logical call.
    async fn dispatch(&self, key: &str, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut auth_retried = false;
        let mut server_attempts: u32 = 0;
        loop {
            if let Some(remaining) = self.lock().cooldown_remaining(key, Instant::now()) {
                return Err(GatewayError::RateLimited { retry_after: remaining });
            }

            let token = self.tokens.get_valid_token().await?;
            let req = ApiRequest {
                method,
                path: path.to_string(),
                bearer: token.bearer(),
                body: body.clone(),
            };
            let sent = tokio::time::timeout(self.settings.request_timeout, self.transport.send(req)).await;
            let resp: ApiResponse = match sent {
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    warn!(key, timeout_ms = self.settings.request_timeout.as_millis() as u64, "request timed out");
                    self.record_failure(key);
                    return Err(GatewayError::Timeout(self.settings.request_timeout));
                }
                Ok(Err(TransportError::Network(message))) => {
                    server_attempts += 1;
                    if server_attempts > self.settings.server_max_retries {
                        warn!(key, err = %message, "network failure after retries");
                        self.record_failure(key);
                        return Err(GatewayError::UpstreamUnavailable { status: None, message });
                    }
                    let delay = self.settings.server_delay(server_attempts);
                    debug!(key, attempt = server_attempts, delay_ms = delay.as_millis() as u64, err = %message, "network failure; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(Ok(resp)) => resp,
            };

            match resp.status {
                200..=299 => {
                    self.record_success(key);
                    return parse_body(key, &resp.body);
                }
                401 => {
                    if auth_retried {
                        self.tokens.expire().await;
                        self.record_failure(key);
                        return Err(GatewayError::AuthExpired);
                    }
                    auth_retried = true;
                    info!(key, "401 from API; refreshing token and retrying once");
                    self.tokens.recover_unauthorized(&token.access_token).await?;
                }
                429 => {
                    let (delay, exhausted) = self.record_rate_limited(key, resp.retry_after);
                    warn!(key, delay_ms = delay.as_millis() as u64, exhausted, "rate limited");
                    tokio::time::sleep(delay).await;
                    if exhausted {
                        let remaining = self
                            .lock()
                            .cooldown_remaining(key, Instant::now())
                            .unwrap_or(Duration::ZERO);
                        return Err(GatewayError::RateLimited { retry_after: remaining });
                    }
                }
                status @ 500..=599 => {
                    server_attempts += 1;
                    if server_attempts > self.settings.server_max_retries {
                        warn!(key, status, "server error after retries");
                        self.record_failure(key);
                        return Err(GatewayError::UpstreamUnavailable {
                            status: Some(status),
                            message: error_message(&resp.body),
                        });
                    }
                    let delay = self.settings.server_delay(server_attempts);
                    debug!(key, status, attempt = server_attempts, delay_ms = delay.as_millis() as u64, "server error; backing off");
                    tokio::time::sleep(delay).await;
                }
                status => {
                    debug!(key, status, "request rejected");
                    return Err(GatewayError::Rejected { status, message: error_message(&resp.body) });
                }
            }
        }
    }

    fn record_success(&self, key: &str) {
        self.lock().retry.remove(key);
    }

    fn record_failure(&self, key: &str) {
        let mut t = self.lock();
        let state = t.retry.entry(key.to_string()).or_default();
        state.failures += 1;
        state.backoff = self.settings.server_delay(state.failures);
        state.updated_at = Some(Instant::now());
    }

    /// Returns the delay before the next attempt and whether the budget is
    /// exhausted (the key is now cooling down).
    fn record_rate_limited(&self, key: &str, retry_after: Option<Duration>) -> (Duration, bool) {
        let mut t = self.lock();
        let now = Instant::now();
        let state = t.retry.entry(key.to_string()).or_default();
        state.rate_limited += 1;
        state.failures += 1;
        let hint = retry_after.unwrap_or(self.settings.rate_limit_default_delay);
        let shift = (state.rate_limited - 1).min(16);
        let delay = hint
            .saturating_mul(1u32 << shift)
            .max(state.rate_delay)
            .min(self.settings.rate_limit_max_delay);
        state.rate_delay = delay;
        state.backoff = delay;
        state.updated_at = Some(now);
        let exhausted = state.rate_limited >= self.settings.rate_limit_max_retries;
        if exhausted {
            state.cooldown_until = Some(now + self.settings.rate_limit_cooldown);
        }
        (delay, exhausted)
    }
}

/// Cache and retry-state key for a call.
pub fn request_key(method: Method, path: &str) -> String {
    format!("{}:{}", method, path)
}

/// In-flight key: `METHOD:path`, plus a body fingerprint for writes that
/// carry one, so only identical writes collapse.
fn dedup_key(method: Method, path: &str, body: Option<&Value>) -> String {
    let key = request_key(method, path);
    match body {
        None => key,
        Some(b) => {
            let digest = Sha256::digest(b.to_string().as_bytes());
            let fingerprint: String = digest.iter().take(8).map(|byte| format!("{:02x}", byte)).collect();
            format!("{}#{}", key, fingerprint)
        }
    }
}

fn body_opt(body: Value) -> Option<Value> {
    if body.is_null() {
        None
    } else {
        Some(body)
    }
}

fn parse_body(key: &str, body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|e| GatewayError::InvalidResponse(format!("{}: {}", key, e)))
}

/// Web API errors look like `{"error":{"status":404,"message":"..."}}`.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|j| {
            j["error"]["message"]
                .as_str()
                .or_else(|| j["error_description"].as_str())
                .or_else(|| j["error"].as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn resource_path(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// True when one path equals the other or is its ancestor on a segment boundary.
fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_ancestor(p: &str, q: &str) -> bool {
        q.len() > p.len() && q.starts_with(p) && q.as_bytes()[p.len()] == b'/'
    }
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}
