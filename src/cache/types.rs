//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::FetchRequest;

/// Identity of a cached request: method plus URL (fragment ignored).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn for_request(request: &FetchRequest) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }

  /// Key for a plain GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Result from a cache operation, including data and metadata about the source.
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
  /// Fresh data straight from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from the cache while a refresh runs in the background.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// The offline page, served in place of an unreachable document.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::OfflineFallback,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached copy; a revalidation was started
  Cache,
  /// Network unavailable, nothing cached, offline document served instead
  OfflineFallback,
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::get(&Url::parse("http://localhost/about/#team").unwrap());
    let b = RequestKey::get(&Url::parse("http://localhost/about/").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_distinguishes_method_and_query() {
    let url = Url::parse("http://localhost/reports/?page=2").unwrap();
    let get = RequestKey::get(&url);
    let mut post = FetchRequest::get(url.clone());
    post.method = Method::POST;
    let other = RequestKey::get(&Url::parse("http://localhost/reports/?page=3").unwrap());

    assert_ne!(get.cache_hash(), RequestKey::for_request(&post).cache_hash());
    assert_ne!(get.cache_hash(), other.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }
}
