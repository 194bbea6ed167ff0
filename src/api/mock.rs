use super::{ApiRequest, ApiResponse, ExchangeError, Method, TokenExchanger, Transport, TransportError};
use crate::models::TokenResponse;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Scripted reply for one dispatch.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(ApiResponse),
    /// Respond after sleeping on the tokio clock.
    Delayed(Duration, ApiResponse),
    /// Never respond; exercises the gateway timeout.
    Hang,
    NetworkError(String),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: String,
    pub body: Option<Value>,
    pub at: Instant,
}

/// In-process transport replaying scripted replies per `METHOD path`.
/// Replies are consumed in order; the last one repeats. Unscripted routes
/// answer 404. Every dispatch is recorded with its tokio timestamp.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, method: Method, path: &str, reply: MockReply) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.entry(route_key(method, path)).or_default().push_back(reply);
        self
    }

    pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.on(method, path, MockReply::Respond(ApiResponse::json(status, &body)))
    }

    /// Drop the remaining script for a route.
    pub fn reset(&self, method: Method, path: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.remove(&route_key(method, path));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    fn next_reply(&self, method: Method, path: &str) -> Option<MockReply> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let queue = routes.get_mut(&route_key(method, path))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn route_key(method: Method, path: &str) -> String {
    format!("{} {}", method, path)
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        debug!("MockTransport: {} {}", req.method, req.path);
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(RecordedCall {
            method: req.method,
            path: req.path.clone(),
            bearer: req.bearer.clone(),
            body: req.body.clone(),
            at: Instant::now(),
        });
        match self.next_reply(req.method, &req.path) {
            Some(MockReply::Respond(resp)) => Ok(resp),
            Some(MockReply::Delayed(delay, resp)) => {
                tokio::time::sleep(delay).await;
                Ok(resp)
            }
            Some(MockReply::Hang) => {
                futures::future::pending::<()>().await;
                Err(TransportError::Network("unreachable".into()))
            }
            Some(MockReply::NetworkError(msg)) => Err(TransportError::Network(msg)),
            None => Ok(ApiResponse::new(404, r#"{"error":{"status":404,"message":"no mock"}}"#)),
        }
    }
}

/// Token endpoint double. Scripted results are returned first; afterwards
/// every call succeeds with a fresh `access-N` token valid for an hour.
#[derive(Default)]
pub struct MockTokenExchanger {
    script: Mutex<VecDeque<Result<TokenResponse, ExchangeError>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    delay: Duration,
}

impl MockTokenExchanger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every exchange on the tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, result: Result<TokenResponse, ExchangeError>) -> &Self {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).iter().map(|(_, at)| *at).collect()
    }

    /// Refresh tokens presented to the endpoint, in call order.
    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).iter().map(|(rt, _)| rt.clone()).collect()
    }
}

/// Convenience token body.
pub fn token_response(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResponse {
    TokenResponse {
        access_token: access.to_string(),
        token_type: Some("Bearer".into()),
        expires_in,
        refresh_token: refresh.map(String::from),
        scope: None,
    }
}

#[async_trait]
impl TokenExchanger for MockTokenExchanger {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ExchangeError> {
        let n = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push((refresh_token.to_string(), Instant::now()));
            calls.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or_else(|| Ok(token_response(&format!("access-{}", n), None, 3600)))
    }
}
