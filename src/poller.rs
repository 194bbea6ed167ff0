//! Adaptive polling for resources the remote API cannot push.
//!
//! Each polled resource runs one session task. A session polls quickly
//! while the resource reports activity, slowly while it is idle, backs off
//! while the gateway is failing or cooling down for it, and stops fetching
//! entirely while the consumer is not visible. Subscribers only hear about
//! results that differ from the last one published.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::models::PlaybackState;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A polled value. `same_as` decides whether a new result is worth
/// publishing; `is_active` selects the fast interval.
pub trait Observed: Clone + Send + Sync + 'static {
    fn same_as(&self, other: &Self) -> bool;

    fn is_active(&self) -> bool {
        false
    }
}

impl Observed for PlaybackState {
    // progress moves on every poll while playing; it is not a change
    fn same_as(&self, other: &Self) -> bool {
        self.track_id() == other.track_id()
            && self.is_playing == other.is_playing
            && self.shuffle_state == other.shuffle_state
            && self.repeat_state == other.repeat_state
            && self.device.as_ref().and_then(|d| d.id.as_deref()) == other.device.as_ref().and_then(|d| d.id.as_deref())
    }

    fn is_active(&self) -> bool {
        self.is_playing
    }
}

impl<T: Observed> Observed for Option<T> {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(b),
            _ => false,
        }
    }

    fn is_active(&self) -> bool {
        self.as_ref().map(Observed::is_active).unwrap_or(false)
    }
}

impl Observed for serde_json::Value {
    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

/// Whether a fetch may be answered from the gateway cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Cached,
    /// Used for the first fetch after visibility returns.
    Fresh,
}

pub type Fetcher<T> = Arc<dyn Fn(FetchMode) -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub type SubscriptionId = Uuid;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub max_backoff: Duration,
    /// Gateway `METHOD:path` key whose retry state stretches the interval.
    pub gateway_key: Option<String>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default(), None)
    }
}

impl PollPolicy {
    pub fn from_config(cfg: &Config, gateway_key: Option<String>) -> Self {
        Self {
            active_interval: Duration::from_secs(cfg.poll_active_secs),
            idle_interval: Duration::from_secs(cfg.poll_idle_secs),
            max_backoff: Duration::from_secs(cfg.poll_max_backoff_secs),
            gateway_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Started, first fetch not yet issued.
    Idle,
    Active,
    /// Consumer not visible; no fetches.
    Paused,
    Stopped,
}

/// Snapshot of one resource's session.
#[derive(Debug, Clone)]
pub struct PollingSession {
    pub state: SessionState,
    pub interval: Duration,
    pub last_poll_at: Option<Instant>,
    pub fetches: u64,
}

#[derive(Debug, Clone, Copy)]
struct Visibility {
    visible: bool,
    /// Bumped on every hidden -> visible transition.
    resumes: u64,
}

struct SessionSlot {
    id: u64,
    info: PollingSession,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    /// Held while a result is published; stop_polling waits on it.
    publish: Arc<Mutex<()>>,
}

struct Registry<T> {
    sessions: HashMap<String, SessionSlot>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback<T>)>>,
    latest: HashMap<String, T>,
    next_id: u64,
}

struct Inner<T> {
    gateway: Option<Gateway>,
    visibility: watch::Sender<Visibility>,
    registry: Mutex<Registry<T>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in registry.sessions.values() {
            slot.cancel.cancel();
        }
    }
}

/// Cheap to clone; clones share sessions and subscribers.
pub struct PollScheduler<T: Observed> {
    inner: Arc<Inner<T>>,
}

impl<T: Observed> Clone for PollScheduler<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Observed> PollScheduler<T> {
    /// Scheduler whose intervals follow `gateway`'s retry state.
    pub fn new(gateway: Gateway) -> Self {
        Self::build(Some(gateway))
    }

    /// Scheduler that only backs off on its own fetch failures.
    pub fn standalone() -> Self {
        Self::build(None)
    }

    fn build(gateway: Option<Gateway>) -> Self {
        let (visibility, _) = watch::channel(Visibility { visible: true, resumes: 0 });
        Self {
            inner: Arc::new(Inner {
                gateway,
                visibility,
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    subscribers: HashMap::new(),
                    latest: HashMap::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Begin polling `resource`, replacing any session already running for it.
    pub fn start_polling(&self, resource: impl Into<String>, fetcher: Fetcher<T>, policy: PollPolicy) {
        let resource = resource.into();
        self.stop_polling(&resource);

        let cancel = CancellationToken::new();
        let publish = Arc::new(Mutex::new(()));
        let visibility = self.inner.visibility.subscribe();

        let mut reg = self.inner.lock();
        let id = reg.next_id;
        reg.next_id += 1;
        let handle = tokio::spawn(run_session(
            Arc::downgrade(&self.inner),
            SessionCtx {
                id,
                resource: resource.clone(),
                fetcher,
                policy: policy.clone(),
                cancel: cancel.clone(),
                publish: Arc::clone(&publish),
            },
            visibility,
        ));
        reg.sessions.insert(
            resource.clone(),
            SessionSlot {
                id,
                info: PollingSession {
                    state: SessionState::Idle,
                    interval: policy.active_interval,
                    last_poll_at: None,
                    fetches: 0,
                },
                cancel,
                handle: Some(handle),
                publish,
            },
        );
        info!(resource = %resource, active_ms = policy.active_interval.as_millis() as u64, "polling started");
    }

    /// Stop polling `resource`. No fetch is issued and nothing is published
    /// for it after this returns. Returns false when nothing was running.
    ///
    /// Must not be called from a subscriber callback of the same resource.
    pub fn stop_polling(&self, resource: &str) -> bool {
        let stopped = {
            let mut reg = self.inner.lock();
            match reg.sessions.get_mut(resource) {
                Some(slot) if slot.info.state != SessionState::Stopped => {
                    slot.cancel.cancel();
                    if let Some(handle) = slot.handle.take() {
                        handle.abort();
                    }
                    slot.info.state = SessionState::Stopped;
                    Some(Arc::clone(&slot.publish))
                }
                _ => None,
            }
        };
        match stopped {
            Some(publish) => {
                // wait out a publish that was already under way
                drop(publish.lock().unwrap_or_else(|e| e.into_inner()));
                info!(resource, "polling stopped");
                true
            }
            None => false,
        }
    }

    /// Report consumer visibility. Hidden sessions stop fetching; on return
    /// every running session fetches once immediately, bypassing the cache.
    pub fn set_visible(&self, visible: bool) {
        let changed = self.inner.visibility.send_if_modified(|v| {
            if v.visible == visible {
                return false;
            }
            v.visible = visible;
            if visible {
                v.resumes += 1;
            }
            true
        });
        if changed {
            info!(visible, "consumer visibility changed");
        }
    }

    pub fn is_visible(&self) -> bool {
        self.inner.visibility.borrow().visible
    }

    /// Register `callback` for changed results of `resource`. Subscriptions
    /// outlive session restarts.
    pub fn subscribe(&self, resource: &str, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .subscribers
            .entry(resource.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut reg = self.inner.lock();
        let mut removed = false;
        for subs in reg.subscribers.values_mut() {
            let before = subs.len();
            subs.retain(|(sub, _)| *sub != id);
            removed |= subs.len() != before;
        }
        reg.subscribers.retain(|_, subs| !subs.is_empty());
        removed
    }

    /// Last published result for `resource`.
    pub fn latest(&self, resource: &str) -> Option<T> {
        self.inner.lock().latest.get(resource).cloned()
    }

    pub fn session(&self, resource: &str) -> Option<PollingSession> {
        self.inner.lock().sessions.get(resource).map(|slot| slot.info.clone())
    }

    pub fn session_state(&self, resource: &str) -> Option<SessionState> {
        self.session(resource).map(|s| s.state)
    }
}

impl<T: Observed> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_session(&self, id: u64, resource: &str, f: impl FnOnce(&mut PollingSession)) {
        let mut reg = self.lock();
        if let Some(slot) = reg.sessions.get_mut(resource) {
            if slot.id == id && slot.info.state != SessionState::Stopped {
                f(&mut slot.info);
            }
        }
    }

    /// Publish `value` unless the session was stopped or nothing changed.
    fn publish(&self, ctx: &SessionCtx<T>, value: T) -> bool {
        let _publishing = ctx.publish.lock().unwrap_or_else(|e| e.into_inner());
        if ctx.cancel.is_cancelled() {
            debug!(resource = %ctx.resource, "discarding result of stopped session");
            return false;
        }
        let callbacks: Vec<Callback<T>> = {
            let mut reg = self.lock();
            if let Some(prev) = reg.latest.get(&ctx.resource) {
                if prev.same_as(&value) {
                    return false;
                }
            }
            reg.latest.insert(ctx.resource.clone(), value.clone());
            reg.subscribers
                .get(&ctx.resource)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        debug!(resource = %ctx.resource, subscribers = callbacks.len(), "publishing changed result");
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    fn next_interval(&self, policy: &PollPolicy, outcome: &Result<bool>, failures: u32) -> Duration {
        let snapshot = match (&self.gateway, &policy.gateway_key) {
            (Some(gateway), Some(key)) => gateway.retry_state(key),
            _ => None,
        };
        if let Some(remaining) = snapshot.as_ref().and_then(|s| s.cooldown_remaining) {
            return remaining.max(policy.active_interval);
        }
        match outcome {
            Ok(true) => policy.active_interval,
            Ok(false) => policy.idle_interval,
            Err(GatewayError::RateLimited { retry_after }) => (*retry_after).max(policy.active_interval),
            Err(_) => {
                let backoff = snapshot
                    .filter(|s| s.failures > 0)
                    .map(|s| s.backoff)
                    .unwrap_or_else(|| {
                        let shift = failures.saturating_sub(1).min(16);
                        policy.active_interval.saturating_mul(1u32 << shift)
                    });
                backoff.max(policy.active_interval).min(policy.max_backoff)
            }
        }
    }
}

struct SessionCtx<T> {
    id: u64,
    resource: String,
    fetcher: Fetcher<T>,
    policy: PollPolicy,
    cancel: CancellationToken,
    publish: Arc<Mutex<()>>,
}

async fn run_session<T: Observed>(inner: Weak<Inner<T>>, ctx: SessionCtx<T>, mut visibility: watch::Receiver<Visibility>) {
    let mut seen_resumes = visibility.borrow().resumes;
    let mut failures: u32 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        if !visibility.borrow_and_update().visible {
            match inner.upgrade() {
                Some(inner) => inner.update_session(ctx.id, &ctx.resource, |s| s.state = SessionState::Paused),
                None => return,
            }
            debug!(resource = %ctx.resource, "polling paused");
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return,
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if visibility.borrow_and_update().visible {
                            break;
                        }
                    }
                }
            }
        }

        let mode = {
            let current = *visibility.borrow_and_update();
            if current.resumes != seen_resumes {
                seen_resumes = current.resumes;
                debug!(resource = %ctx.resource, "resumed; forcing fresh fetch");
                FetchMode::Fresh
            } else {
                FetchMode::Cached
            }
        };

        match inner.upgrade() {
            Some(inner) => inner.update_session(ctx.id, &ctx.resource, |s| {
                s.state = SessionState::Active;
                s.last_poll_at = Some(Instant::now());
                s.fetches += 1;
            }),
            None => return,
        }

        let fetched = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            res = (ctx.fetcher)(mode) => res,
        };

        let Some(strong) = inner.upgrade() else { return };
        let outcome = match fetched {
            Ok(value) => {
                failures = 0;
                let active = value.is_active();
                strong.publish(&ctx, value);
                Ok(active)
            }
            Err(e) => {
                failures += 1;
                warn!(resource = %ctx.resource, failures, err = %e, "poll failed");
                Err(e)
            }
        };
        let interval = strong.next_interval(&ctx.policy, &outcome, failures);
        strong.update_session(ctx.id, &ctx.resource, |s| s.interval = interval);
        drop(strong);
        debug!(resource = %ctx.resource, interval_ms = interval.as_millis() as u64, "next poll scheduled");

        // any visibility transition ends the wait early; the loop head sorts out which
        let deadline = Instant::now() + interval;
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
            changed = visibility.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, TrackItem};

    fn playing(track: &str, progress: u64) -> PlaybackState {
        PlaybackState {
            is_playing: true,
            progress_ms: Some(progress),
            shuffle_state: false,
            repeat_state: "off".into(),
            device: Some(Device { id: Some("dev".into()), name: "Desk".into(), volume_percent: Some(40) }),
            item: Some(TrackItem {
                id: Some(track.into()),
                name: track.into(),
                uri: format!("spotify:track:{}", track),
                duration_ms: Some(200_000),
                artists: vec![],
            }),
        }
    }

    #[test]
    fn progress_alone_is_not_a_change() {
        assert!(playing("a", 1_000).same_as(&playing("a", 6_000)));
        assert!(!playing("a", 1_000).same_as(&playing("b", 1_000)));
        let mut paused = playing("a", 1_000);
        paused.is_playing = false;
        assert!(!paused.same_as(&playing("a", 1_000)));
    }

    #[test]
    fn nothing_playing_is_idle() {
        let none: Option<PlaybackState> = None;
        assert!(!none.is_active());
        assert!(Some(playing("a", 0)).is_active());
        assert!(!none.same_as(&Some(playing("a", 0))));
    }
}
