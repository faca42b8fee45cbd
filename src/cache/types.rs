//! Request and response types shared by the cache store and the worker.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

/// Identity of a cached request: method plus origin-relative URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  /// Upper-cased HTTP method
  pub method: String,
  /// Path and query string, without fragment
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &str) -> Self {
    let url = url.split_once('#').map_or(url, |(before, _)| before);
    let url = if url.is_empty() { "/" } else { url };

    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Key for a plain `GET`, which is how manifest entries are requested.
  pub fn get(url: &str) -> Self {
    Self::new("GET", url)
  }

  /// Stable, fixed-length hash used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// An intercepted request on its way to the cache or the network.
#[derive(Debug, Clone)]
pub struct CacheRequest {
  pub key: RequestKey,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CacheRequest {
  pub fn new(key: RequestKey) -> Self {
    Self {
      key,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: &str) -> Self {
    Self::new(RequestKey::get(url))
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }
}

/// A fully captured response: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// Whether the status is in the 2xx range.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value matching `name`, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response as stored in a named cache.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  /// When the entry was written during install
  pub cached_at: DateTime<Utc>,
}

/// Summary of one cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
  pub name: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Which path served an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Stored entry from the current generation
  Cache,
  /// Live network result, not stored
  Network,
}

/// Result of a fetch interception.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: CachedResponse,
  pub source: FetchSource,
}

impl FetchOutcome {
  pub fn from_cache(response: CachedResponse) -> Self {
    Self {
      response,
      source: FetchSource::Cache,
    }
  }

  pub fn from_network(response: CachedResponse) -> Self {
    Self {
      response,
      source: FetchSource::Network,
    }
  }
}

/// Headers that belong to a single connection and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
  const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
  ];
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Convert a raw header into a stored pair.
///
/// Values that are not valid UTF-8 cannot be stored and are skipped with a
/// warning.
pub fn header_entry(name: &str, value: &[u8]) -> Option<(String, String)> {
  match std::str::from_utf8(value) {
    Ok(value) => Some((name.to_string(), value.to_string())),
    Err(_) => {
      warn!(header = name, bytes = value.len(), "Dropping non UTF-8 header value");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_uppercases_method() {
    let key = RequestKey::new("get", "/formaggi");
    assert_eq!(key.method, "GET");
    assert_eq!(key, RequestKey::get("/formaggi"));
  }

  #[test]
  fn test_request_key_strips_fragment_keeps_query() {
    let key = RequestKey::get("/produzioni?anno=2024#top");
    assert_eq!(key.url, "/produzioni?anno=2024");
    assert_ne!(key, RequestKey::get("/produzioni"));
  }

  #[test]
  fn test_request_key_empty_url_is_root() {
    assert_eq!(RequestKey::get("").url, "/");
    assert_eq!(RequestKey::get("#anchor").url, "/");
  }

  #[test]
  fn test_cache_hash_depends_on_method() {
    let get = RequestKey::get("/a.png");
    let post = RequestKey::new("POST", "/a.png");
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_eq!(get.cache_hash(), RequestKey::get("/a.png").cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }

  #[test]
  fn test_response_success_range() {
    assert!(CachedResponse::new(200, vec![], vec![]).is_success());
    assert!(CachedResponse::new(204, vec![], vec![]).is_success());
    assert!(!CachedResponse::new(304, vec![], vec![]).is_success());
    assert!(!CachedResponse::new(500, vec![], vec![]).is_success());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = CachedResponse::new(
      200,
      vec![("Content-Type".to_string(), "image/svg+xml".to_string())],
      vec![],
    );
    assert_eq!(response.header("content-type"), Some("image/svg+xml"));
    assert_eq!(response.header("etag"), None);
  }

  #[test]
  fn test_header_entry() {
    assert_eq!(
      header_entry("etag", b"\"abc\""),
      Some(("etag".to_string(), "\"abc\"".to_string()))
    );
    assert_eq!(header_entry("x-raw", &[0x66, 0xff, 0x6f]), None);
  }

  #[test]
  fn test_hop_by_hop() {
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(is_hop_by_hop("host"));
    assert!(!is_hop_by_hop("content-type"));
  }
}
