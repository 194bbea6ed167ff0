use playback_gateway as lib;
use lib::api::mock::{MockReply, MockTokenExchanger, MockTransport};
use lib::api::{ApiResponse, Method};
use lib::error::GatewayError;
use lib::gateway::{CallOptions, Gateway, GatewaySettings};
use lib::models::{AuthState, TokenState};
use lib::store::MemoryTokenStore;
use lib::token::{TokenManager, TokenSettings};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn live_token(access: &str) -> TokenState {
    TokenState {
        access_token: access.to_string(),
        token_type: "Bearer".into(),
        expires_at: chrono::Utc::now().timestamp() + 3600,
        refresh_token: Some("rt".into()),
        scope: None,
    }
}

struct Harness {
    gateway: Gateway,
    transport: Arc<MockTransport>,
    exchanger: Arc<MockTokenExchanger>,
    store: Arc<MemoryTokenStore>,
}

fn harness() -> Harness {
    harness_with(GatewaySettings::default())
}

fn harness_with(settings: GatewaySettings) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let exchanger = Arc::new(MockTokenExchanger::new());
    let store = Arc::new(MemoryTokenStore::new(Some(live_token("initial"))));
    let tokens = TokenManager::new(store.clone(), exchanger.clone(), TokenSettings::default());
    let gateway = Gateway::new(transport.clone(), tokens, settings);
    Harness { gateway, transport, exchanger, store }
}

fn rate_limited(secs: u64) -> MockReply {
    MockReply::Respond(
        ApiResponse::json(429, &json!({"error": {"status": 429, "message": "API rate limit exceeded"}}))
            .with_retry_after(Duration::from_secs(secs)),
    )
}

#[tokio::test(start_paused = true)]
async fn identical_concurrent_reads_share_one_call() {
    let h = harness();
    h.transport.on(
        Method::Get,
        "/me/player",
        MockReply::Delayed(Duration::from_millis(50), ApiResponse::json(200, &json!({"is_playing": true}))),
    );

    let results = futures::future::join_all((0..3).map(|_| h.gateway.get("/me/player"))).await;

    assert_eq!(h.transport.calls_to(Method::Get, "/me/player"), 1);
    for r in results {
        assert_eq!(r.expect("ok"), json!({"is_playing": true}));
    }
    assert_eq!(h.gateway.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failures_are_shared_by_joined_callers() {
    let h = harness();
    h.transport.on(
        Method::Get,
        "/playlists/gone",
        MockReply::Delayed(Duration::from_millis(50), ApiResponse::json(404, &json!({"error": {"status": 404, "message": "Not found."}}))),
    );

    let results = futures::future::join_all((0..2).map(|_| h.gateway.get("/playlists/gone"))).await;

    assert_eq!(h.transport.calls_to(Method::Get, "/playlists/gone"), 1);
    for r in results {
        assert_eq!(r, Err(GatewayError::Rejected { status: 404, message: "Not found.".into() }));
    }
}

#[tokio::test(start_paused = true)]
async fn writes_with_different_bodies_run_one_after_the_other() {
    let h = harness();
    let reply = MockReply::Delayed(Duration::from_secs(1), ApiResponse::json(201, &json!({"snapshot_id": "s"})));
    h.transport.on(Method::Post, "/playlists/p1/tracks", reply);

    let a = json!({"uris": ["spotify:track:a"]});
    let b = json!({"uris": ["spotify:track:b"]});
    let c = json!({"uris": ["spotify:track:c"]});
    let (ra, rb, ra2, rc) = tokio::join!(
        h.gateway.post("/playlists/p1/tracks", a.clone()),
        h.gateway.post("/playlists/p1/tracks", b.clone()),
        h.gateway.post("/playlists/p1/tracks", a.clone()),
        h.gateway.post("/playlists/p1/tracks", c.clone()),
    );
    assert!(ra.is_ok() && rb.is_ok() && ra2.is_ok() && rc.is_ok());

    // identical bodies collapse; different ones are queued, never concurrent
    let calls: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter(|c| c.method == Method::Post && c.path == "/playlists/p1/tracks")
        .collect();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].body.as_ref(), Some(&a));
    assert_eq!(calls[1].body.as_ref(), Some(&b));
    assert_eq!(calls[2].body.as_ref(), Some(&c));
    for pair in calls.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_secs(1), "overlapping writes: {:?}", pair[1].at - pair[0].at);
    }
    assert_eq!(h.gateway.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_write_fails_fast_once_the_key_cools_down() {
    let h = harness();
    h.transport.on(Method::Put, "/playlists/p1", rate_limited(1));

    let (first, second) = tokio::join!(
        h.gateway.put("/playlists/p1", json!({"name": "one"})),
        h.gateway.put("/playlists/p1", json!({"name": "two"})),
    );
    assert!(matches!(first, Err(GatewayError::RateLimited { .. })));
    assert!(matches!(second, Err(GatewayError::RateLimited { .. })));
    // only the first write reached the API; the queued one hit the cool-down
    assert_eq!(h.transport.calls_to(Method::Put, "/playlists/p1"), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_pruned_as_new_results_settle() {
    let h = harness();
    for i in 0..20 {
        h.transport.respond(Method::Get, &format!("/search?q=song{}", i), 200, json!({"tracks": {"items": []}}));
    }
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));
    h.transport.respond(Method::Get, "/broken", 500, json!({}));

    for i in 0..20 {
        h.gateway.get(&format!("/search?q=song{}", i)).await.expect("search");
    }
    assert_eq!(h.gateway.cached_count(), 20);
    assert!(h.gateway.get("/broken").await.is_err());
    assert_eq!(h.gateway.tracked_retry_keys(), 1);

    // search results live 10s, failure bookkeeping one cool-down period
    tokio::time::sleep(Duration::from_secs(61)).await;
    h.gateway.get("/me").await.expect("me");
    assert_eq!(h.gateway.cached_count(), 1);
    assert_eq!(h.gateway.tracked_retry_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn reads_are_cached_for_their_ttl() {
    let h = harness();
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));

    h.gateway.get("/me").await.expect("first");
    tokio::time::sleep(Duration::from_secs(29)).await;
    h.gateway.get("/me").await.expect("cached");
    assert_eq!(h.transport.calls_to(Method::Get, "/me"), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.gateway.get("/me").await.expect("expired");
    assert_eq!(h.transport.calls_to(Method::Get, "/me"), 2);
}

#[tokio::test(start_paused = true)]
async fn player_uses_short_ttl_and_fresh_bypasses_cache() {
    let h = harness();
    h.transport.respond(Method::Get, "/me/player", 200, json!({"is_playing": false}));

    h.gateway.get("/me/player").await.expect("first");
    tokio::time::sleep(Duration::from_secs(4)).await;
    h.gateway.get("/me/player").await.expect("ttl of 3s elapsed");
    assert_eq!(h.transport.calls_to(Method::Get, "/me/player"), 2);

    h.gateway.get_fresh("/me/player").await.expect("fresh");
    assert_eq!(h.transport.calls_to(Method::Get, "/me/player"), 3);

    let opts = CallOptions { bypass_cache: false, ttl: Some(Duration::from_secs(60)) };
    h.gateway.get_fresh("/me/player").await.expect("fresh");
    h.gateway.execute(Method::Get, "/me/player", None, opts).await.expect("served from the refreshed cache");
    assert_eq!(h.transport.calls_to(Method::Get, "/me/player"), 4);
}

#[tokio::test(start_paused = true)]
async fn writes_invalidate_affected_reads_only() {
    let h = harness();
    h.transport.respond(Method::Get, "/playlists/p1", 200, json!({"name": "Old"}));
    h.transport.respond(Method::Get, "/playlists/p1/tracks", 200, json!({"items": []}));
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));
    h.transport.respond(Method::Put, "/playlists/p1", 200, Value::Null);

    for path in ["/playlists/p1", "/playlists/p1/tracks", "/me"] {
        h.gateway.get(path).await.expect("prime");
    }
    h.gateway.put("/playlists/p1", json!({"name": "New"})).await.expect("rename");
    for path in ["/playlists/p1", "/playlists/p1/tracks", "/me"] {
        h.gateway.get(path).await.expect("read");
    }

    assert_eq!(h.transport.calls_to(Method::Get, "/playlists/p1"), 2);
    assert_eq!(h.transport.calls_to(Method::Get, "/playlists/p1/tracks"), 2);
    assert_eq!(h.transport.calls_to(Method::Get, "/me"), 1);
}

#[tokio::test(start_paused = true)]
async fn read_overtaken_by_write_is_not_cached() {
    let h = harness();
    h.transport.on(
        Method::Get,
        "/playlists/p1",
        MockReply::Delayed(Duration::from_millis(100), ApiResponse::json(200, &json!({"name": "Old"}))),
    );
    h.transport.respond(Method::Put, "/playlists/p1", 200, Value::Null);

    let read = {
        let gw = h.gateway.clone();
        tokio::spawn(async move { gw.get("/playlists/p1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.gateway.put("/playlists/p1", json!({"name": "New"})).await.expect("write");
    read.await.expect("join").expect("read");

    h.gateway.get("/playlists/p1").await.expect("re-read");
    assert_eq!(h.transport.calls_to(Method::Get, "/playlists/p1"), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backs_off_then_cools_down() {
    let h = harness();
    h.transport.on(Method::Get, "/playlists", rate_limited(2));
    let start = Instant::now();

    let err = h.gateway.get("/playlists").await.expect_err("budget exhausted");
    assert!(matches!(err, GatewayError::RateLimited { .. }), "{:?}", err);

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].at - start, Duration::ZERO);
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(2));
    assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(4));
    assert_eq!(Instant::now() - calls[2].at, Duration::from_secs(8));

    // cooling down: fail fast without touching the network
    let again = h.gateway.get("/playlists").await;
    assert!(matches!(again, Err(GatewayError::RateLimited { retry_after }) if retry_after > Duration::ZERO));
    assert_eq!(h.transport.calls().len(), 3);

    let snapshot = h.gateway.retry_state("GET:/playlists").expect("retry state");
    assert_eq!(snapshot.rate_limited, 3);
    assert!(snapshot.cooldown_remaining.is_some());

    // other keys are unaffected
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));
    h.gateway.get("/me").await.expect("independent key");

    tokio::time::sleep(Duration::from_secs(61)).await;
    h.transport.reset(Method::Get, "/playlists");
    h.transport.respond(Method::Get, "/playlists", 200, json!({"items": []}));
    h.gateway.get("/playlists").await.expect("cool-down over");
    assert!(h.gateway.retry_state("GET:/playlists").is_none());
}

#[tokio::test(start_paused = true)]
async fn rate_limit_without_hint_uses_default_delay() {
    let h = harness();
    h.transport.respond(Method::Get, "/browse", 429, json!({}));
    h.transport.respond(Method::Get, "/browse", 200, json!({"ok": true}));

    h.gateway.get("/browse").await.expect("second attempt");
    let calls = h.transport.calls();
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
    assert!(h.gateway.retry_state("GET:/browse").is_none());
}

#[tokio::test(start_paused = true)]
async fn unauthorized_refreshes_once_and_retries() {
    let h = harness();
    h.transport.respond(Method::Get, "/me", 401, json!({"error": {"status": 401, "message": "The access token expired"}}));
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));

    let me = h.gateway.get("/me").await.expect("retried");
    assert_eq!(me, json!({"id": "u1"}));
    assert_eq!(h.exchanger.calls(), 1);
    let calls = h.transport.calls();
    assert_eq!(calls[0].bearer, "Bearer initial");
    assert_eq!(calls[1].bearer, "Bearer access-1");
}

#[tokio::test(start_paused = true)]
async fn second_unauthorized_expires_the_session() {
    let h = harness();
    h.transport.respond(Method::Get, "/me", 401, json!({"error": {"status": 401, "message": "Invalid access token"}}));

    assert_eq!(h.gateway.get("/me").await, Err(GatewayError::AuthExpired));
    assert_eq!(h.transport.calls_to(Method::Get, "/me"), 2);
    assert_eq!(h.exchanger.calls(), 1);
    assert_eq!(h.gateway.tokens().status(), AuthState::Unauthenticated);
    assert!(h.store.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_unauthorized_calls_share_one_refresh() {
    let h = harness();
    for path in ["/me", "/me/playlists"] {
        h.transport.respond(Method::Get, path, 401, json!({}));
        h.transport.respond(Method::Get, path, 200, json!({"ok": path}));
    }
    let (a, b) = tokio::join!(h.gateway.get("/me"), h.gateway.get("/me/playlists"));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.exchanger.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_then_surface() {
    let h = harness();
    h.transport.respond(Method::Get, "/me/top/tracks", 503, json!({"error": {"status": 503, "message": "Service unavailable"}}));

    let err = h.gateway.get("/me/top/tracks").await.expect_err("persistent 503");
    assert_eq!(
        err,
        GatewayError::UpstreamUnavailable { status: Some(503), message: "Service unavailable".into() }
    );
    let calls = h.transport.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[1].at - calls[0].at, Duration::from_millis(500));
    assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(1));
    assert_eq!(calls[3].at - calls[2].at, Duration::from_secs(2));
    assert_eq!(h.gateway.retry_state("GET:/me/top/tracks").map(|s| s.failures), Some(1));
}

#[tokio::test(start_paused = true)]
async fn transient_server_error_recovers() {
    let h = harness();
    h.transport.respond(Method::Get, "/me", 502, json!({}));
    h.transport.on(Method::Get, "/me", MockReply::NetworkError("connection reset".into()));
    h.transport.respond(Method::Get, "/me", 200, json!({"id": "u1"}));

    assert_eq!(h.gateway.get("/me").await, Ok(json!({"id": "u1"})));
    assert_eq!(h.transport.calls_to(Method::Get, "/me"), 3);
}

#[tokio::test(start_paused = true)]
async fn timeout_settles_and_clears_in_flight() {
    let h = harness();
    h.transport.on(Method::Get, "/me/player", MockReply::Hang);
    let start = Instant::now();

    let err = h.gateway.get("/me/player").await.expect_err("hangs");
    assert_eq!(err, GatewayError::Timeout(Duration::from_secs(10)));
    assert_eq!(Instant::now() - start, Duration::from_secs(10));
    assert_eq!(h.gateway.in_flight_count(), 0);

    h.transport.reset(Method::Get, "/me/player");
    h.transport.respond(Method::Get, "/me/player", 200, json!({"is_playing": true}));
    h.gateway.get("/me/player").await.expect("next call dispatches anew");
    assert_eq!(h.transport.calls_to(Method::Get, "/me/player"), 2);
}

#[tokio::test(start_paused = true)]
async fn empty_success_is_null_and_garbage_is_invalid() {
    let h = harness();
    h.transport.on(Method::Get, "/me/player", MockReply::Respond(ApiResponse::new(204, "")));
    h.transport.on(Method::Get, "/me/broken", MockReply::Respond(ApiResponse::new(200, "<html>")));

    assert_eq!(h.gateway.get("/me/player").await, Ok(Value::Null));
    assert!(matches!(h.gateway.get("/me/broken").await, Err(GatewayError::InvalidResponse(_))));
}

#[tokio::test(start_paused = true)]
async fn no_token_means_auth_expired_without_io() {
    let transport = Arc::new(MockTransport::new());
    let tokens = TokenManager::new(
        Arc::new(MemoryTokenStore::default()),
        Arc::new(MockTokenExchanger::new()),
        TokenSettings::default(),
    );
    let gateway = Gateway::new(transport.clone(), tokens, GatewaySettings::default());

    assert_eq!(gateway.get("/me").await, Err(GatewayError::AuthExpired));
    assert!(transport.calls().is_empty());
}
