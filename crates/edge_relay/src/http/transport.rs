use anyhow::Context;
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Status and body of a completed HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP seam for the media store and session API clients.
///
/// A response with any status is `Ok`; only failures to complete the exchange
/// (connect, timeout, reset) are `DomainError::Transport`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> DomainResult<HttpResponse>;

    async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &BTreeMap<String, String>,
    ) -> DomainResult<HttpResponse>;
}

/// `HttpTransport` backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
}

impl ReqwestHttpTransport {
    pub fn new(timeout: Duration) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("weighvision-edge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")
            .map_err(DomainError::Transport)?;
        Ok(Self { client })
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> DomainResult<HttpResponse> {
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))
            .map_err(DomainError::Transport)?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed to read response from {}", url))
            .map_err(DomainError::Transport)?;

        debug!(url = %url, status, bytes = body.len(), "http exchange complete");
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> DomainResult<HttpResponse> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url).await
    }

    async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &BTreeMap<String, String>,
    ) -> DomainResult<HttpResponse> {
        let mut request = self.client.put(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url).await
    }
}
