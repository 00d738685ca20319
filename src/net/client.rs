use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;

use crate::error::WorkerError;

use super::types::{Request, ResponseSnapshot};

/// Outbound network boundary.
///
/// A resolved fetch is a success regardless of HTTP status; only transport
/// failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> std::result::Result<ResponseSnapshot, WorkerError>;
}

/// `reqwest`-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("pwa-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> std::result::Result<ResponseSnapshot, WorkerError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| WorkerError::invalid_request(&request.url, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_builder() {
        WorkerError::invalid_request(&request.url, e)
      } else {
        WorkerError::network(&request.url, e)
      }
    })?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    // Read the whole body now; the snapshot must be complete before any handoff
    let body = response
      .bytes()
      .await
      .map_err(|e| WorkerError::network(&request.url, e))?;

    Ok(ResponseSnapshot {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}
