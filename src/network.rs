//! Network capability used on install and on cache misses.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::{header_entry, is_hop_by_hop, CacheRequest, CachedResponse};

/// Something that can perform a live fetch for an intercepted request.
///
/// A transport failure is an `Err`; any HTTP status, including 5xx, is a
/// successful fetch whose response the caller inspects.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse>;
}

#[async_trait]
impl<N: Network> Network for Arc<N> {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse> {
    (**self).fetch(request).await
  }
}

/// HTTP client that resolves request URLs against a fixed origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    // Redirects are part of the response handed back to the page
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  /// Absolute URL for an origin-relative request URL.
  fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid request URL {}: {}", url, e))
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse> {
    let url = self.resolve(&request.key.url)?;
    let method = reqwest::Method::from_bytes(request.key.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.key.method, e))?;

    let mut builder = self.client.request(method, url.clone());
    for (name, value) in &request.headers {
      if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| header_entry(name.as_str(), value.as_bytes()))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", url, e))?
      .to_vec();

    Ok(CachedResponse::new(status, headers, body))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn network(origin: &str) -> HttpNetwork {
    HttpNetwork::new(Url::parse(origin).unwrap(), Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn test_resolve_against_origin() {
    let network = network("http://127.0.0.1:5173");
    assert_eq!(
      network.resolve("/formaggi").unwrap().as_str(),
      "http://127.0.0.1:5173/formaggi"
    );
    assert_eq!(
      network.resolve("/produzioni?anno=2024").unwrap().as_str(),
      "http://127.0.0.1:5173/produzioni?anno=2024"
    );
  }

  #[test]
  fn test_resolve_root() {
    let network = network("https://caseificio.example");
    assert_eq!(
      network.resolve("/").unwrap().as_str(),
      "https://caseificio.example/"
    );
  }

  #[tokio::test]
  async fn test_unreachable_origin_is_an_error() {
    // Port 9 (discard) is closed on loopback in test environments
    let network = network("http://127.0.0.1:9");
    let result = network.fetch(&CacheRequest::get("/")).await;
    assert!(result.is_err());
  }
}
