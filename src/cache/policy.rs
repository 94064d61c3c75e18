//! Which requests the cache layer is allowed to touch.

use tracing::warn;
use url::{Origin, Url};

use crate::config::CacheConfig;
use crate::net::FetchRequest;

/// Routing decision for an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  /// Serve through the cache
  Intercept,
  /// Leave the request alone
  PassThrough(PassReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassReason {
  NotGet,
  CrossOrigin,
  /// Matched one of the excluded patterns (API, analytics, real-time)
  Excluded(String),
  /// No cache generation has been activated yet
  NoActiveGeneration,
}

#[derive(Debug, Clone)]
pub struct RequestPolicy {
  origin: Url,
  allowed_origins: Vec<Origin>,
  excluded_patterns: Vec<String>,
}

impl RequestPolicy {
  pub fn new(origin: Url, config: &CacheConfig) -> Self {
    Self {
      origin,
      allowed_origins: config
        .allowed_origins
        .iter()
        .filter_map(|entry| match Url::parse(entry) {
          Ok(url) => Some(url.origin()),
          Err(e) => {
            warn!(%entry, error = %e, "Ignoring invalid allowed origin");
            None
          }
        })
        .collect(),
      excluded_patterns: config.excluded_patterns.clone(),
    }
  }

  pub fn classify(&self, request: &FetchRequest) -> Route {
    if !self.is_allowed_origin(&request.url) {
      return Route::PassThrough(PassReason::CrossOrigin);
    }

    if !request.is_get() {
      return Route::PassThrough(PassReason::NotGet);
    }

    let url = request.url.as_str();
    if let Some(pattern) = self
      .excluded_patterns
      .iter()
      .find(|p| url.contains(p.as_str()))
    {
      return Route::PassThrough(PassReason::Excluded(pattern.clone()));
    }

    Route::Intercept
  }

  /// Same origin as the site, or exactly one of the allow-listed CDN origins.
  pub fn is_allowed_origin(&self, url: &Url) -> bool {
    let origin = url.origin();
    origin == self.origin.origin() || self.allowed_origins.contains(&origin)
  }
}
