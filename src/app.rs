use crate::cache::{CacheSource, CacheStorage, FetchDecision, SqliteStorage};
use crate::config::Config;
use crate::event::{EventHandler, HostEvent};
use crate::net::{FetchRequest, HttpNetwork, Network};
use crate::queue::{Payload, QueueStore};
use crate::sync::{
  ConnectivityMonitor, ConnectivityProbe, FormSubmission, SubmitOutcome, Transition,
};
use crate::worker::{EventOutcome, ServiceWorker, WorkerEvent};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Shared network client
  network: Arc<HttpNetwork>,

  /// Event dispatcher over the cache and the queue
  worker: ServiceWorker<SqliteStorage, HttpNetwork>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let queue = Arc::new(QueueStore::open(&data_dir.join("queue.db"))?);
    let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
    let network = Arc::new(HttpNetwork::new()?);

    let worker = ServiceWorker::from_config(storage, queue, Arc::clone(&network), &config)?;

    Ok(Self {
      config,
      network,
      worker,
    })
  }

  fn probe(&self) -> Result<ConnectivityProbe<HttpNetwork>> {
    Ok(ConnectivityProbe::new(
      Arc::clone(&self.network),
      self.config.resolve(&self.config.sync.probe_path)?,
      self.config.sync.probe_timeout(),
    ))
  }

  pub async fn install(&self) -> Result<()> {
    match self.worker.dispatch(WorkerEvent::Install).await? {
      EventOutcome::Installed { assets, activated } => {
        println!(
          "Installed {} ({} assets){}",
          self.worker.cache().generation(),
          assets,
          if activated { ", now active" } else { "" }
        );
        Ok(())
      }
      other => Err(eyre!("Unexpected install outcome: {:?}", other)),
    }
  }

  pub async fn activate(&self) -> Result<()> {
    match self.worker.dispatch(WorkerEvent::Activate).await? {
      EventOutcome::Activated { purged } => {
        println!("Activated {}", self.worker.cache().generation());
        for name in purged {
          println!("  purged {}", name);
        }
        Ok(())
      }
      other => Err(eyre!("Unexpected activate outcome: {:?}", other)),
    }
  }

  pub fn status(&self) -> Result<()> {
    let cache = self.worker.cache();
    let queue = self.worker.sync().queue();

    println!("Origin:      {}", self.config.origin);
    println!("Generation:  {} ({:?})", cache.generation(), cache.state()?);
    println!(
      "Active:      {}",
      cache
        .storage()
        .active_generation()?
        .unwrap_or_else(|| "none".to_string())
    );
    println!("Queued:      {}", queue.len()?);
    let quarantined = queue.quarantined_len()?;
    if quarantined > 0 {
      println!("Unreadable:  {} (quarantined)", quarantined);
    }

    let tags = queue.registered_tags()?;
    if tags.is_empty() {
      println!("Sync tags:   none");
    } else {
      println!("Sync tags:   {}", tags.join(", "));
    }

    Ok(())
  }

  /// Route a GET through the cache layer and write the body to stdout.
  pub async fn fetch(&self, target: &str, accept: &str) -> Result<()> {
    let url = self.config.resolve(target)?;
    let request = FetchRequest::get(url).with_header("Accept", accept);

    let (response, source) = match self
      .worker
      .dispatch(WorkerEvent::Fetch(request.clone()))
      .await?
    {
      EventOutcome::Fetched(FetchDecision::Respond(result)) => (result.data, Some(result.source)),
      EventOutcome::Fetched(FetchDecision::PassThrough(reason)) => {
        info!(?reason, "Not handled by the cache, fetching directly");
        (self.network.fetch(request).await?, None)
      }
      other => return Err(eyre!("Unexpected fetch outcome: {:?}", other)),
    };

    info!(
      status = response.status,
      source = ?source.unwrap_or(CacheSource::Network),
      bytes = response.body.len(),
      "Fetched {}",
      target
    );

    // Let the background refresh finish before the process exits.
    self.worker.settle().await;

    std::io::stdout()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write response: {}", e))?;
    Ok(())
  }

  /// A form submission attempt, as made by the page.
  pub async fn submit(
    &self,
    fields: Payload,
    auth_token: String,
    success_url: Option<String>,
    force_offline: bool,
  ) -> Result<()> {
    let online = !force_offline && self.probe()?.is_online().await;
    let form = FormSubmission {
      fields,
      auth_token,
      success_url,
    };

    match self.worker.sync().submit(form, online).await? {
      SubmitOutcome::Delivered { status } => println!("Report submitted (HTTP {})", status),
      SubmitOutcome::Queued(ack) => {
        println!("{}", ack.message);
        println!("Continue at {}", ack.redirect);
      }
    }
    Ok(())
  }

  pub fn list_queue(&self) -> Result<()> {
    let entries = self.worker.sync().queue().list_all()?;
    if entries.is_empty() {
      println!("No queued submissions");
      return Ok(());
    }

    for entry in entries {
      println!(
        "#{} captured {} {}",
        entry.id,
        entry.captured_at.to_rfc3339(),
        serde_json::to_string(&entry.payload)?
      );
    }
    Ok(())
  }

  /// Deliver one deferred-sync wake event.
  pub async fn sync(&self, tag: Option<String>) -> Result<()> {
    let tag = tag.unwrap_or_else(|| self.config.sync.tag.clone());

    match self.worker.dispatch(WorkerEvent::Sync { tag: tag.clone() }).await? {
      EventOutcome::Synced(report) => {
        println!(
          "Delivered {}, still queued {}",
          report.delivered.len(),
          report.retained.len()
        );
        if let Some(error) = report.error {
          println!("Sync could not run: {}", error);
        }
      }
      EventOutcome::Ignored => println!("No handler for sync tag '{}'", tag),
      other => return Err(eyre!("Unexpected sync outcome: {:?}", other)),
    }
    Ok(())
  }

  /// Show a push notification, optionally following it as if clicked.
  pub async fn push(&self, payload: Option<String>, click: bool) -> Result<()> {
    let data = payload.map(String::into_bytes);

    let notification = match self.worker.dispatch(WorkerEvent::Push { data }).await? {
      EventOutcome::Notify(notification) => notification,
      EventOutcome::Ignored => {
        println!("Push without data, nothing to show");
        return Ok(());
      }
      other => return Err(eyre!("Unexpected push outcome: {:?}", other)),
    };

    println!("{}", serde_json::to_string_pretty(&notification)?);

    if click {
      if let EventOutcome::Navigate(url) = self
        .worker
        .dispatch(WorkerEvent::NotificationClick(notification))
        .await?
      {
        println!("Open {}", url);
      }
    }
    Ok(())
  }

  /// Act as the host platform: watch connectivity and wake pending syncs
  /// whenever we come back online.
  pub async fn watch(&self) -> Result<()> {
    let mut events = EventHandler::new(self.probe()?, self.config.sync.poll_interval());
    let mut monitor = ConnectivityMonitor::default();

    info!(origin = %self.config.origin, "Watching connectivity");

    while let Some(event) = events.next().await {
      match event {
        HostEvent::Shutdown => break,
        HostEvent::Connectivity(online) => match monitor.observe(online) {
          Some(Transition::WentOnline) => {
            info!("Back online");
            // A failed wake waits for the next transition.
            if let Err(e) = self.worker.wake_pending_syncs().await {
              warn!(error = %e, "Deferred sync failed");
            }
          }
          Some(Transition::WentOffline) => info!("Connection lost"),
          None => {}
        },
      }
    }

    self.worker.settle().await;
    info!("Stopped watching");
    Ok(())
  }
}
