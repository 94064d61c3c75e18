//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::{PassReason, RequestPolicy, Route};
use super::storage::CacheStorage;
use super::types::{CacheResult, RequestKey};
use crate::config::Config;
use crate::net::{FetchRequest, Network, Response};

/// What the fetch handler decided to do with a request.
#[derive(Debug)]
pub enum FetchDecision {
  /// Not ours; the caller sends it over the network untouched.
  PassThrough(PassReason),
  /// Answered by the cache layer.
  Respond(CacheResult<Response>),
}

/// Install/activate progress of this layer's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Nothing precached yet (or the last install failed)
  New,
  /// Precached, waiting for activation; an older generation may still serve
  Installed,
  /// Serving traffic
  Active,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client,
/// providing stale-while-revalidate reads with an offline fallback page.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  policy: RequestPolicy,
  /// Generation this layer installs and activates
  generation: String,
  offline_page: Url,
  precache: Vec<Url>,
  /// Background refreshes started by cache hits
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(
    storage: S,
    network: Arc<N>,
    policy: RequestPolicy,
    generation: impl Into<String>,
    offline_page: Url,
    precache: Vec<Url>,
  ) -> Self {
    Self {
      storage: Arc::new(storage),
      network,
      policy,
      generation: generation.into(),
      offline_page,
      precache,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn from_config(storage: S, network: Arc<N>, config: &Config) -> Result<Self> {
    let precache = config
      .cache
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self::new(
      storage,
      network,
      RequestPolicy::new(config.origin.clone(), &config.cache),
      config.cache.generation(),
      config.resolve(&config.cache.offline_page)?,
      precache,
    ))
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn state(&self) -> Result<LifecycleState> {
    if self.storage.active_generation()?.as_deref() == Some(self.generation.as_str()) {
      return Ok(LifecycleState::Active);
    }
    if self.storage.generations()?.contains(&self.generation) {
      return Ok(LifecycleState::Installed);
    }
    Ok(LifecycleState::New)
  }

  /// Precache the manifest into this layer's generation.
  ///
  /// All-or-nothing: if any asset fails to download (transport error or a
  /// non-2xx status) nothing is written and the install has to be retried.
  pub async fn install(&self) -> Result<usize> {
    info!(
      generation = %self.generation,
      assets = self.precache.len(),
      "Installing cache generation"
    );

    let fetches = self.precache.iter().map(|url| {
      let network = Arc::clone(&self.network);
      let url = url.clone();
      async move {
        let response = network
          .fetch(FetchRequest::get(url.clone()))
          .await
          .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
        if !response.is_success() {
          return Err(eyre!(
            "Failed to precache {}: status {}",
            url,
            response.status
          ));
        }
        Ok((RequestKey::get(&url), response))
      }
    });

    let entries = futures::future::try_join_all(fetches).await?;
    self.storage.put_all(&self.generation, &entries)?;

    info!(generation = %self.generation, "Cache generation installed");
    Ok(entries.len())
  }

  /// Purge every other generation and start serving from ours.
  ///
  /// Returns the names of the purged generations.
  pub fn activate(&self) -> Result<Vec<String>> {
    let generations = self.storage.generations()?;
    if !generations.contains(&self.generation) {
      return Err(eyre!(
        "Cannot activate {}: it has not been installed",
        self.generation
      ));
    }

    let mut purged = Vec::new();
    for name in generations {
      if name != self.generation {
        self.storage.delete_generation(&name)?;
        debug!(generation = %name, "Purged old cache generation");
        purged.push(name);
      }
    }

    self.storage.set_active_generation(&self.generation)?;
    info!(generation = %self.generation, purged = purged.len(), "Cache generation active");

    Ok(purged)
  }

  /// Handle one outgoing request.
  ///
  /// 1. Excluded, cross-origin and non-GET requests pass through
  /// 2. A hit in the active generation is returned at once and refreshed in
  ///    the background
  /// 3. A miss waits for the network and stores a 200 response
  /// 4. A miss with the network down gets the offline page if it is a
  ///    navigation, otherwise the network error
  pub async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchDecision> {
    if let Route::PassThrough(reason) = self.policy.classify(&request) {
      debug!(url = %request.url, ?reason, "Passing request through");
      return Ok(FetchDecision::PassThrough(reason));
    }

    // Until something activates, no generation controls traffic.
    let Some(active) = self.storage.active_generation()? else {
      return Ok(FetchDecision::PassThrough(PassReason::NoActiveGeneration));
    };

    let key = RequestKey::for_request(&request);

    if let Some(cached) = self.storage.lookup(&active, &key)? {
      debug!(url = %request.url, "Cache hit");
      self.spawn_revalidation(active, key, request)?;
      return Ok(FetchDecision::Respond(CacheResult::from_cache(
        cached.response,
        cached.cached_at,
      )));
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        store_if_cacheable(self.storage.as_ref(), &active, &key, &response);
        Ok(FetchDecision::Respond(CacheResult::from_network(response)))
      }
      Err(e) => {
        if request.accepts_html() {
          let offline_key = RequestKey::get(&self.offline_page);
          if let Some(page) = self.storage.lookup(&active, &offline_key)? {
            warn!(url = %request.url, error = %e, "Network unavailable, serving offline page");
            return Ok(FetchDecision::Respond(CacheResult::offline(
              page.response,
              page.cached_at,
            )));
          }
        }
        Err(e.into())
      }
    }
  }

  fn spawn_revalidation(&self, generation: String, key: RequestKey, request: FetchRequest) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);

    let mut tasks = self
      .revalidations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Reap refreshes that already finished.
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      match network.fetch(request).await {
        Ok(response) => store_if_cacheable(storage.as_ref(), &generation, &key, &response),
        Err(e) => debug!(url = %key.url, error = %e, "Revalidation failed, keeping cached copy"),
      }
    });

    Ok(())
  }

  /// Wait for background revalidations started so far.
  pub async fn settle(&self) {
    let mut tasks = match self.revalidations.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(_) => return,
    };

    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Revalidation task failed");
      }
    }
  }
}

/// Only a plain 200 is worth keeping.
fn store_if_cacheable<S: CacheStorage>(
  storage: &S,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) {
  if response.status != 200 {
    debug!(url = %key.url, status = response.status, "Not caching response");
    return;
  }

  match storage.put(generation, key, response) {
    Ok(true) => {}
    Ok(false) => debug!(url = %key.url, %generation, "Generation purged, dropping refreshed copy"),
    Err(e) => warn!(url = %key.url, error = %e, "Failed to update cache"),
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      policy: self.policy.clone(),
      generation: self.generation.clone(),
      offline_page: self.offline_page.clone(),
      precache: self.precache.clone(),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::config::CacheConfig;
  use crate::error::OfflineError;
  use crate::net::testing::SwitchableNetwork;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  struct Site {
    server: MockServer,
    network: Arc<SwitchableNetwork>,
  }

  impl Site {
    async fn start() -> Self {
      let server = MockServer::start().await;
      for (asset, body, content_type) in [
        ("/", "<h1>Kings Park CPF</h1>", "text/html"),
        ("/offline.html", "<h1>You are offline</h1>", "text/html"),
        ("/static/css/style.css", "body{}", "text/css"),
      ] {
        Mock::given(method("GET"))
          .and(path(asset))
          .respond_with(
            ResponseTemplate::new(200)
              .insert_header("content-type", content_type)
              .set_body_string(body),
          )
          .mount(&server)
          .await;
      }

      Self {
        server,
        network: Arc::new(SwitchableNetwork::new()),
      }
    }

    fn url(&self, path: &str) -> Url {
      Url::parse(&format!("{}{}", self.server.uri(), path)).unwrap()
    }

    fn layer(&self, version: &str, storage: SqliteStorage) -> CacheLayer<SqliteStorage, SwitchableNetwork> {
      let cache = CacheConfig {
        version: version.to_string(),
        ..CacheConfig::default()
      };
      CacheLayer::new(
        storage,
        Arc::clone(&self.network),
        RequestPolicy::new(self.url("/"), &cache),
        cache.generation(),
        self.url("/offline.html"),
        vec![self.url("/"), self.url("/offline.html"), self.url("/static/css/style.css")],
      )
    }

    async fn active_layer(&self) -> CacheLayer<SqliteStorage, SwitchableNetwork> {
      let layer = self.layer("v1", SqliteStorage::open_in_memory().unwrap());
      layer.install().await.unwrap();
      layer.activate().unwrap();
      layer
    }
  }

  fn page(url: Url) -> FetchRequest {
    FetchRequest::get(url).with_header("Accept", "text/html")
  }

  fn respond(decision: FetchDecision) -> CacheResult<Response> {
    match decision {
      FetchDecision::Respond(result) => result,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_lifecycle_states() {
    let site = Site::start().await;
    let layer = site.layer("v1", SqliteStorage::open_in_memory().unwrap());

    assert_eq!(layer.state().unwrap(), LifecycleState::New);
    assert_eq!(layer.install().await.unwrap(), 3);
    assert_eq!(layer.state().unwrap(), LifecycleState::Installed);
    layer.activate().unwrap();
    assert_eq!(layer.state().unwrap(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let site = Site::start().await;
    let cache = CacheConfig::default();
    let layer = CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      Arc::clone(&site.network),
      RequestPolicy::new(site.url("/"), &cache),
      cache.generation(),
      site.url("/offline.html"),
      vec![site.url("/"), site.url("/static/missing.js")],
    );

    assert!(layer.install().await.is_err());
    assert!(layer.storage().generations().unwrap().is_empty());
    assert_eq!(layer.state().unwrap(), LifecycleState::New);
    assert!(layer.activate().is_err());
  }

  #[tokio::test]
  async fn test_install_fails_offline() {
    let site = Site::start().await;
    let layer = site.layer("v1", SqliteStorage::open_in_memory().unwrap());
    site.network.set_online(false);

    assert!(layer.install().await.is_err());
    assert_eq!(layer.state().unwrap(), LifecycleState::New);
  }

  #[tokio::test]
  async fn test_no_active_generation_passes_through() {
    let site = Site::start().await;
    let layer = site.layer("v1", SqliteStorage::open_in_memory().unwrap());
    layer.install().await.unwrap();

    let decision = layer.handle_fetch(page(site.url("/"))).await.unwrap();
    assert!(matches!(
      decision,
      FetchDecision::PassThrough(PassReason::NoActiveGeneration)
    ));
  }

  #[tokio::test]
  async fn test_precached_asset_served_offline() {
    let site = Site::start().await;
    let layer = site.active_layer().await;
    site.network.set_online(false);

    let result = respond(
      layer
        .handle_fetch(FetchRequest::get(site.url("/static/css/style.css")))
        .await
        .unwrap(),
    );
    layer.settle().await;

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.text(), "body{}");
    assert_eq!(result.data.content_type.as_deref(), Some("text/css"));
  }

  #[tokio::test]
  async fn test_uncached_document_offline_gets_fallback() {
    let site = Site::start().await;
    let layer = site.active_layer().await;
    site.network.set_online(false);

    let result = respond(
      layer
        .handle_fetch(page(site.url("/community-alerts/")))
        .await
        .unwrap(),
    );

    assert_eq!(result.source, CacheSource::OfflineFallback);
    assert_eq!(result.data.text(), "<h1>You are offline</h1>");
  }

  #[tokio::test]
  async fn test_uncached_asset_offline_surfaces_error() {
    let site = Site::start().await;
    let layer = site.active_layer().await;
    site.network.set_online(false);

    let err = layer
      .handle_fetch(FetchRequest::get(site.url("/static/js/new.js")))
      .await
      .unwrap_err();
    assert!(matches!(
      err.downcast_ref::<OfflineError>(),
      Some(OfflineError::NetworkUnavailable(_))
    ));
  }

  #[tokio::test]
  async fn test_miss_fetches_and_stores() {
    let site = Site::start().await;
    Mock::given(method("GET"))
      .and(path("/about/"))
      .respond_with(ResponseTemplate::new(200).set_body_string("about us"))
      .expect(1)
      .mount(&site.server)
      .await;
    let layer = site.active_layer().await;

    let first = respond(layer.handle_fetch(page(site.url("/about/"))).await.unwrap());
    assert_eq!(first.source, CacheSource::Network);

    site.network.set_online(false);
    let second = respond(layer.handle_fetch(page(site.url("/about/"))).await.unwrap());
    layer.settle().await;
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.text(), "about us");
  }

  #[tokio::test]
  async fn test_hit_is_revalidated_in_background() {
    let site = Site::start().await;
    let layer = site.active_layer().await;

    // The site changes after install
    site.server.reset().await;
    Mock::given(method("GET"))
      .and(path("/static/css/style.css"))
      .respond_with(ResponseTemplate::new(200).set_body_string("body{color:red}"))
      .mount(&site.server)
      .await;

    let stale = respond(
      layer
        .handle_fetch(FetchRequest::get(site.url("/static/css/style.css")))
        .await
        .unwrap(),
    );
    assert_eq!(stale.data.text(), "body{}");
    layer.settle().await;

    let fresh = respond(
      layer
        .handle_fetch(FetchRequest::get(site.url("/static/css/style.css")))
        .await
        .unwrap(),
    );
    layer.settle().await;
    assert_eq!(fresh.source, CacheSource::Cache);
    assert_eq!(fresh.data.text(), "body{color:red}");
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let site = Site::start().await;
    Mock::given(method("GET"))
      .and(path("/broken/"))
      .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
      .mount(&site.server)
      .await;
    let layer = site.active_layer().await;

    let result = respond(layer.handle_fetch(page(site.url("/broken/"))).await.unwrap());
    assert_eq!(result.data.status, 500);

    let urls = layer.storage().urls(layer.generation()).unwrap();
    assert!(!urls.iter().any(|u| u.ends_with("/broken/")));
  }

  #[tokio::test]
  async fn test_excluded_requests_never_cached() {
    let site = Site::start().await;
    let layer = site.active_layer().await;

    for path in ["/api/reports/", "/static/js/analytics.js", "/socket.io/?EIO=4"] {
      for _ in 0..2 {
        let decision = layer.handle_fetch(page(site.url(path))).await.unwrap();
        assert!(matches!(
          decision,
          FetchDecision::PassThrough(PassReason::Excluded(_))
        ));
      }
    }
    layer.settle().await;

    for generation in layer.storage().generations().unwrap() {
      for url in layer.storage().urls(&generation).unwrap() {
        assert!(!url.contains("/api/"), "{}", url);
        assert!(!url.contains("analytics"), "{}", url);
        assert!(!url.contains("socket.io"), "{}", url);
      }
    }
  }

  #[tokio::test]
  async fn test_old_generation_serves_until_activation() {
    let site = Site::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    let v1 = site.layer("v1", SqliteStorage::open(&db).unwrap());
    v1.install().await.unwrap();
    v1.activate().unwrap();

    let v2 = site.layer("v2", SqliteStorage::open(&db).unwrap());
    v2.install().await.unwrap();
    assert_eq!(v2.state().unwrap(), LifecycleState::Installed);
    assert_eq!(
      v2.storage().active_generation().unwrap().as_deref(),
      Some("kingspark-cpf-v1")
    );

    // v1 still answers while v2 waits
    site.network.set_online(false);
    let result = respond(v2.handle_fetch(page(site.url("/"))).await.unwrap());
    assert_eq!(result.source, CacheSource::Cache);
    v2.settle().await;
    site.network.set_online(true);

    let purged = v2.activate().unwrap();
    assert_eq!(purged, vec!["kingspark-cpf-v1"]);
    assert_eq!(v2.storage().generations().unwrap(), vec!["kingspark-cpf-v2"]);
    assert_eq!(v1.state().unwrap(), LifecycleState::New);
  }

  #[tokio::test]
  async fn test_late_revalidation_does_not_restore_purged_generation() {
    let site = Site::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    let v1 = site.layer("v1", SqliteStorage::open(&db).unwrap());
    v1.install().await.unwrap();
    v1.activate().unwrap();
    let v2 = site.layer("v2", SqliteStorage::open(&db).unwrap());
    v2.install().await.unwrap();

    // The refresh of the v1 hit lands after v2 has taken over
    Mock::given(method("GET"))
      .and(path("/static/css/style.css"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_string("body{color:red}")
          .set_delay(std::time::Duration::from_millis(300)),
      )
      .with_priority(1)
      .mount(&site.server)
      .await;

    let hit = respond(
      v2.handle_fetch(FetchRequest::get(site.url("/static/css/style.css")))
        .await
        .unwrap(),
    );
    assert_eq!(hit.source, CacheSource::Cache);

    assert_eq!(v2.activate().unwrap(), vec!["kingspark-cpf-v1"]);
    v2.settle().await;

    assert_eq!(v2.storage().generations().unwrap(), vec!["kingspark-cpf-v2"]);
    assert!(v2.storage().urls("kingspark-cpf-v1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_reinstall_drops_assets_left_out_of_manifest() {
    let site = Site::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    let full = site.layer("v1", SqliteStorage::open(&db).unwrap());
    full.install().await.unwrap();

    let cache = CacheConfig::default();
    let trimmed = CacheLayer::new(
      SqliteStorage::open(&db).unwrap(),
      Arc::clone(&site.network),
      RequestPolicy::new(site.url("/"), &cache),
      cache.generation(),
      site.url("/offline.html"),
      vec![site.url("/"), site.url("/offline.html")],
    );
    assert_eq!(trimmed.install().await.unwrap(), 2);

    let urls = trimmed.storage().urls(trimmed.generation()).unwrap();
    assert_eq!(urls.len(), 2);
    assert!(!urls.iter().any(|u| u.ends_with("/static/css/style.css")));
  }
}
