//! Single entry point for everything the host platform can ask of us.
//!
//! Each host callback (install, activate, fetch, sync, push, notification
//! click) is a `WorkerEvent`; `ServiceWorker::dispatch` turns it into an
//! `EventOutcome` describing the response or side effect.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, FetchDecision};
use crate::config::{Config, PushConfig};
use crate::net::{FetchRequest, Network};
use crate::push::Notification;
use crate::queue::QueueStore;
use crate::sync::{DrainReport, SyncCoordinator};

#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(FetchRequest),
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  NotificationClick(Notification),
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed { assets: usize, activated: bool },
  Activated { purged: Vec<String> },
  Fetched(FetchDecision),
  Synced(DrainReport),
  /// Show this notification now
  Notify(Notification),
  /// Open this page
  Navigate(Url),
  /// The event was not meant for us
  Ignored,
}

pub struct ServiceWorker<S: CacheStorage, N: Network> {
  cache: CacheLayer<S, N>,
  sync: SyncCoordinator<N>,
  push: PushConfig,
  origin: Url,
  skip_waiting: bool,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  pub fn new(
    cache: CacheLayer<S, N>,
    sync: SyncCoordinator<N>,
    push: PushConfig,
    origin: Url,
    skip_waiting: bool,
  ) -> Self {
    Self {
      cache,
      sync,
      push,
      origin,
      skip_waiting,
    }
  }

  pub fn from_config(
    storage: S,
    queue: Arc<QueueStore>,
    network: Arc<N>,
    config: &Config,
  ) -> Result<Self> {
    Ok(Self::new(
      CacheLayer::from_config(storage, Arc::clone(&network), config)?,
      SyncCoordinator::from_config(queue, network, config)?,
      config.push.clone(),
      config.origin.clone(),
      config.cache.skip_waiting,
    ))
  }

  pub fn cache(&self) -> &CacheLayer<S, N> {
    &self.cache
  }

  pub fn sync(&self) -> &SyncCoordinator<N> {
    &self.sync
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => {
        let assets = self.cache.install().await?;
        if self.skip_waiting {
          self.cache.activate()?;
        }
        Ok(EventOutcome::Installed {
          assets,
          activated: self.skip_waiting,
        })
      }
      WorkerEvent::Activate => {
        let purged = self.cache.activate()?;
        Ok(EventOutcome::Activated { purged })
      }
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetched(self.cache.handle_fetch(request).await?)),
      WorkerEvent::Sync { tag } => match self.sync.handle_sync(&tag).await {
        Some(report) => {
          // The registration is consumed once nothing is left to retry.
          if report.is_complete() {
            if let Err(e) = self.sync.queue().unregister_sync(&tag) {
              warn!(%tag, error = %e, "Failed to clear sync registration");
            }
          }
          Ok(EventOutcome::Synced(report))
        }
        None => Ok(EventOutcome::Ignored),
      },
      WorkerEvent::Push { data } => match Notification::from_push(data.as_deref(), &self.push)? {
        Some(notification) => Ok(EventOutcome::Notify(notification)),
        None => Ok(EventOutcome::Ignored),
      },
      WorkerEvent::NotificationClick(notification) => {
        Ok(EventOutcome::Navigate(notification.click_target(&self.origin)?))
      }
    }
  }

  /// Wake every pending sync registration, as the host does when
  /// connectivity comes back.
  ///
  /// A non-empty queue without a registration (the registration write failed
  /// at enqueue time) is woken under our own tag too.
  pub async fn wake_pending_syncs(&self) -> Result<Vec<(String, EventOutcome)>> {
    let mut tags = self.sync.queue().registered_tags()?;
    if !tags.iter().any(|t| t == self.sync.tag()) && self.sync.queue().len()? > 0 {
      tags.push(self.sync.tag().to_string());
    }

    let mut outcomes = Vec::with_capacity(tags.len());
    for tag in tags {
      info!(%tag, "Waking deferred sync");
      let outcome = self
        .dispatch(WorkerEvent::Sync { tag: tag.clone() })
        .await?;
      outcomes.push((tag, outcome));
    }

    Ok(outcomes)
  }

  /// Wait for background work started by earlier events.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, LifecycleState, SqliteStorage};
  use crate::net::testing::SwitchableNetwork;
  use crate::sync::FormSubmission;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn site() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_string("page"))
      .mount(&server)
      .await;
    server
  }

  fn worker(
    server: &MockServer,
    network: &Arc<SwitchableNetwork>,
  ) -> ServiceWorker<SqliteStorage, SwitchableNetwork> {
    worker_with_queue(server, network, QueueStore::open_in_memory().unwrap())
  }

  fn worker_with_queue(
    server: &MockServer,
    network: &Arc<SwitchableNetwork>,
    queue: QueueStore,
  ) -> ServiceWorker<SqliteStorage, SwitchableNetwork> {
    let mut config = Config {
      origin: Url::parse(&server.uri()).unwrap(),
      ..Config::default()
    };
    // CDN assets are not reachable from tests
    config.cache.precache = vec!["/".into(), "/offline.html".into(), "/static/css/style.css".into()];

    ServiceWorker::from_config(
      SqliteStorage::open_in_memory().unwrap(),
      Arc::new(queue),
      Arc::clone(network),
      &config,
    )
    .unwrap()
  }

  fn theft() -> FormSubmission {
    FormSubmission {
      fields: [("description".to_string(), "theft".to_string())]
        .into_iter()
        .collect(),
      auth_token: "abc123".to_string(),
      success_url: None,
    }
  }

  #[tokio::test]
  async fn test_install_skips_waiting() {
    let server = site().await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    let outcome = worker.dispatch(WorkerEvent::Install).await.unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Installed {
        assets: 3,
        activated: true
      }
    ));
    assert_eq!(worker.cache().state().unwrap(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_fetch_after_install_served_offline() {
    let server = site().await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);
    worker.dispatch(WorkerEvent::Install).await.unwrap();

    network.set_online(false);
    let url = Url::parse(&format!("{}/static/css/style.css", server.uri())).unwrap();
    let outcome = worker
      .dispatch(WorkerEvent::Fetch(FetchRequest::get(url)))
      .await
      .unwrap();
    worker.settle().await;

    match outcome {
      EventOutcome::Fetched(FetchDecision::Respond(result)) => {
        assert_eq!(result.source, CacheSource::Cache);
        assert_eq!(result.data.text(), "page");
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_sync_clears_registration_when_drained() {
    let server = site().await;
    Mock::given(method("POST"))
      .and(path("/api/reports/submit/"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    worker.sync().submit(theft(), false).await.unwrap();
    assert_eq!(
      worker.sync().queue().registered_tags().unwrap(),
      vec!["crime-report-sync"]
    );

    let outcomes = worker.wake_pending_syncs().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0].1, EventOutcome::Synced(r) if r.is_complete()));
    assert!(worker.sync().queue().registered_tags().unwrap().is_empty());
    assert_eq!(worker.sync().queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_failed_sync_keeps_registration() {
    let server = site().await;
    Mock::given(method("POST"))
      .and(path("/api/reports/submit/"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    worker.sync().submit(theft(), false).await.unwrap();
    let outcome = worker
      .dispatch(WorkerEvent::Sync {
        tag: "crime-report-sync".to_string(),
      })
      .await
      .unwrap();

    assert!(matches!(outcome, EventOutcome::Synced(ref r) if !r.is_complete()));
    assert_eq!(
      worker.sync().queue().registered_tags().unwrap(),
      vec!["crime-report-sync"]
    );
    assert_eq!(worker.sync().queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unregistered_queue_still_woken() {
    let server = site().await;
    Mock::given(method("POST"))
      .and(path("/api/reports/submit/"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    worker.sync().queue_offline(&theft()).unwrap();
    worker
      .sync()
      .queue()
      .unregister_sync("crime-report-sync")
      .unwrap();

    let outcomes = worker.wake_pending_syncs().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(worker.sync().queue().len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unreadable_entry_stops_waking_sync() {
    let server = site().await;
    Mock::given(method("POST"))
      .and(path("/api/reports/submit/"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;
    let network = Arc::new(SwitchableNetwork::new());
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("queue.db");
    let worker = worker_with_queue(&server, &network, QueueStore::open(&db).unwrap());

    worker.sync().submit(theft(), false).await.unwrap();
    rusqlite::Connection::open(&db)
      .unwrap()
      .execute(
        "INSERT INTO unsynced_reports (payload, auth_token, captured_at) VALUES ('{', 't', 'x')",
        [],
      )
      .unwrap();

    let outcomes = worker.wake_pending_syncs().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0].1, EventOutcome::Synced(r) if r.is_complete()));
    assert_eq!(worker.sync().queue().len().unwrap(), 0);
    assert_eq!(worker.sync().queue().quarantined_len().unwrap(), 1);

    // Nothing left to wake on the next transition
    assert!(worker.wake_pending_syncs().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_foreign_sync_tag_ignored() {
    let server = site().await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    let outcome = worker
      .dispatch(WorkerEvent::Sync {
        tag: "newsletter-sync".to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored));
  }

  #[tokio::test]
  async fn test_push_then_click() {
    let server = site().await;
    let network = Arc::new(SwitchableNetwork::new());
    let worker = worker(&server, &network);

    let outcome = worker
      .dispatch(WorkerEvent::Push {
        data: Some(br#"{"message":"Road closed","url":"/community-alerts/"}"#.to_vec()),
      })
      .await
      .unwrap();
    let notification = match outcome {
      EventOutcome::Notify(n) => n,
      other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(notification.title, "Kings Park CPF Update");
    assert_eq!(notification.body, "Road closed");

    let outcome = worker
      .dispatch(WorkerEvent::NotificationClick(notification))
      .await
      .unwrap();
    match outcome {
      EventOutcome::Navigate(url) => {
        assert_eq!(url.as_str(), format!("{}/community-alerts/", server.uri()))
      }
      other => panic!("unexpected outcome {:?}", other),
    }

    let outcome = worker
      .dispatch(WorkerEvent::Push { data: None })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored));
  }
}
