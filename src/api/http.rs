use super::{parse_retry_after, ApiRequest, ApiResponse, Method, Transport, TransportError};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::Client;

/// reqwest-backed transport against a fixed API base URL (e.g.
/// `https://api.spotify.com/v1`). The gateway owns timeouts and retries;
/// this layer only maps one request to one response.
pub struct ReqwestTransport {
    client: Client,
    api_base: String,
}

impl ReqwestTransport {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_base)
    }

    pub fn with_client(client: Client, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { client, api_base }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            // paging `next` links come back as absolute URLs
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.api_base, path)
        } else {
            format!("{}/{}", self.api_base, path)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&req.path);
        let builder = match req.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        let mut builder = builder
            .header(AUTHORIZATION, &req.bearer)
            .header(ACCEPT, "application/json");
        if let Some(body) = &req.body {
            builder = builder.json(body);
        } else if !req.method.is_read() {
            // the Web API rejects bodiless writes without a length
            builder = builder.header(reqwest::header::CONTENT_LENGTH, "0");
        }

        debug!("{} {}", req.method, url);
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| parse_retry_after(s, chrono::Utc::now()));
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("reading body: {}", e)))?;
        debug!("{} {} => {} ({} bytes)", req.method, url, status, body.len());
        Ok(ApiResponse { status, retry_after, body })
    }
}
