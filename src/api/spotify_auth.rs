use super::{pkce, ExchangeError, TokenExchanger};
use crate::config::Config;
use crate::models::{TokenResponse, TokenState};
use crate::token::TokenManager;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

/// Client for the accounts service token endpoint (`{auth_base}/api/token`).
///
/// Confidential clients authenticate with HTTP Basic; public (PKCE) clients
/// send `client_id` in the form instead.
pub struct SpotifyTokenEndpoint {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl SpotifyTokenEndpoint {
    pub fn new(auth_base: &str, client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client: Client::new(),
            token_url: format!("{}/api/token", auth_base.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.auth_base, cfg.client_id.clone(), cfg.client_secret.clone())
    }

    fn basic_auth(&self) -> Option<String> {
        self.client_secret.as_ref().map(|secret| {
            format!(
                "Basic {}",
                general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, secret))
            )
        })
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse, ExchangeError> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        let mut req = self.client.post(&self.token_url);
        match self.basic_auth() {
            Some(header) => req = req.header(AUTHORIZATION, header),
            None => form.push(("client_id", &self.client_id)),
        }
        let resp = req
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "token endpoint returned error");
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ExchangeError::Transient(format!("{} - {}", status, body)));
            }
            return Err(ExchangeError::Rejected { status: status.as_u16(), message: body });
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| ExchangeError::Transient(format!("parse token response: {}", e)))
    }

    /// Authorization-code grant; `verifier` is the PKCE code verifier.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: Option<&str>,
    ) -> Result<TokenResponse, ExchangeError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(v) = verifier {
            params.push(("code_verifier", v));
        }
        self.post_form(&params).await
    }
}

#[async_trait]
impl TokenExchanger for SpotifyTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ExchangeError> {
        self.post_form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }
}

/// Build the authorization URL the user opens in a browser.
pub fn authorize_url(cfg: &Config, code_challenge: &str, state: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/authorize", cfg.auth_base.trim_end_matches('/')))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &cfg.client_id)
        .append_pair("scope", &cfg.scopes.join(" "))
        .append_pair("redirect_uri", &cfg.redirect_uri)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", code_challenge)
        .append_pair("state", state);
    Ok(url)
}

/// Extract the `code` from a pasted redirect URL, checking `state` when given.
pub fn code_from_redirect(redirect: &str, expected_state: Option<&str>) -> Result<String> {
    let parsed = Url::parse(redirect.trim()).map_err(|e| anyhow!("invalid url pasted: {}", e))?;
    if let Some(err) = parsed.query_pairs().find(|(k, _)| k == "error") {
        return Err(anyhow!("authorization denied: {}", err.1));
    }
    if let Some(expected) = expected_state {
        let state = parsed.query_pairs().find(|(k, _)| k == "state").map(|(_, v)| v.into_owned());
        if state.as_deref() != Some(expected) {
            return Err(anyhow!("state mismatch in redirect URL"));
        }
    }
    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .ok_or_else(|| anyhow!("no code in redirect URL"))?
        .1
        .into_owned();
    Ok(code)
}

/// Interactive authorization:
/// 1. Print the authorization URL (PKCE S256).
/// 2. User approves and pastes the redirect URL back.
/// 3. Exchange the code and hand the token to the manager, which persists it
///    and arms the proactive refresh.
pub async fn run_interactive_auth(cfg: &Config, manager: &TokenManager) -> Result<TokenState> {
    use std::io;

    if cfg.client_id.is_empty() {
        return Err(anyhow!("no client_id configured (set client_id or SPOTIFY_CLIENT_ID)"));
    }
    let verifier = pkce::generate_code_verifier();
    let challenge = pkce::code_challenge_s256(&verifier);
    let state = pkce::generate_state();
    let url = authorize_url(cfg, &challenge, &state)?;

    println!("Open this URL in your browser and authorize the application:\n\n{}\n", url);
    println!("After authorizing, copy the full redirect URL and paste it here:");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let code = code_from_redirect(&input, Some(&state))?;

    manager.begin_authorization();
    let endpoint = SpotifyTokenEndpoint::from_config(cfg);
    let resp = match endpoint.exchange_code(&code, &cfg.redirect_uri, Some(&verifier)).await {
        Ok(r) => r,
        Err(e) => {
            manager.abort_authorization();
            return Err(anyhow!("token exchange failed: {}", e));
        }
    };
    let token = TokenState::from_response(resp, chrono::Utc::now().timestamp(), None);
    manager.set_token(token.clone()).await.map_err(|e| anyhow!("storing token: {}", e))?;
    info!("Authorization complete; tokens stored");
    Ok(token)
}
