//! Core types for the response cache: request keys, stored entries and
//! results tagged with where the data came from.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::net::{Request, Response};

/// Identity of a cached request.
///
/// Only GET requests have a key: the storage refuses to hold anything else,
/// and lookups for other methods never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  /// Build the key for a request, or `None` if the request is not cacheable.
  pub fn for_request(request: &Request) -> Option<Self> {
    if request.method != reqwest::Method::GET {
      return None;
    }

    let mut url = request.url.clone();
    url.set_fragment(None);

    Some(Self {
      method: request.method.as_str().to_uppercase(),
      url: url.to_string(),
    })
  }

  /// Rebuild a key from its stored parts.
  pub(crate) fn from_parts(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
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

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response read back from a bucket.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the response was written to the bucket
  pub stored_at: DateTime<Utc>,
}

/// Result from a fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, serving cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(method: reqwest::Method, url: &str) -> Request {
    Request::new(method, url::Url::parse(url).unwrap())
  }

  #[test]
  fn test_get_request_has_key() {
    let key = RequestKey::for_request(&request(reqwest::Method::GET, "https://app.test/index.html"))
      .unwrap();
    assert_eq!(key.method(), "GET");
    assert_eq!(key.url(), "https://app.test/index.html");
    assert_eq!(key.to_string(), "GET https://app.test/index.html");
  }

  #[test]
  fn test_non_get_request_has_no_key() {
    assert!(RequestKey::for_request(&request(reqwest::Method::POST, "https://app.test/api")).is_none());
    assert!(RequestKey::for_request(&request(reqwest::Method::HEAD, "https://app.test/")).is_none());
  }

  #[test]
  fn test_fragment_is_ignored() {
    let plain = RequestKey::for_request(&request(reqwest::Method::GET, "https://app.test/page")).unwrap();
    let with_fragment =
      RequestKey::for_request(&request(reqwest::Method::GET, "https://app.test/page#section")).unwrap();
    assert_eq!(plain, with_fragment);
    assert_eq!(plain.cache_hash(), with_fragment.cache_hash());
  }

  #[test]
  fn test_query_is_significant() {
    let a = RequestKey::for_request(&request(reqwest::Method::GET, "https://app.test/?a=1")).unwrap();
    let b = RequestKey::for_request(&request(reqwest::Method::GET, "https://app.test/?a=2")).unwrap();
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_cache_hash_is_hex_sha256() {
    let key = RequestKey::from_parts("GET".into(), "https://app.test/".into());
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
