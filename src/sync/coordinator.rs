use color_eyre::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::OfflineError;
use crate::net::{FetchRequest, Network};
use crate::queue::{Payload, QueueStore};

/// Header carrying the anti-forgery token on replayed submissions.
pub const CSRF_HEADER: &str = "X-CSRFToken";

const QUEUED_MESSAGE: &str = "You are currently offline. Your report has been saved and will be \
  submitted automatically when you are back online.";

/// A form as the user submitted it.
#[derive(Debug, Clone)]
pub struct FormSubmission {
  pub fields: Payload,
  /// Value of the page's `csrfmiddlewaretoken`
  pub auth_token: String,
  /// Where to send the user once the form is handled (defaults to `/`)
  pub success_url: Option<String>,
}

/// What the user is told after an offline submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
  pub id: i64,
  pub message: String,
  pub redirect: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Sent straight to the server.
  Delivered { status: u16 },
  /// Saved for later; the user has been acknowledged.
  Queued(Acknowledgement),
}

/// Result of one wake event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Ids accepted by the server and removed
  pub delivered: Vec<i64>,
  /// Ids left in the queue, with the reason
  pub retained: Vec<(i64, String)>,
  /// Set when the drain could not start at all
  pub error: Option<String>,
}

impl DrainReport {
  /// Nothing left to retry.
  pub fn is_complete(&self) -> bool {
    self.error.is_none() && self.retained.is_empty()
  }
}

/// Bridges offline submissions into eventual delivery.
pub struct SyncCoordinator<N: Network> {
  queue: Arc<QueueStore>,
  network: Arc<N>,
  origin: Url,
  endpoint: Url,
  tag: String,
}

impl<N: Network> SyncCoordinator<N> {
  pub fn new(
    queue: Arc<QueueStore>,
    network: Arc<N>,
    origin: Url,
    endpoint: Url,
    tag: impl Into<String>,
  ) -> Self {
    Self {
      queue,
      network,
      origin,
      endpoint,
      tag: tag.into(),
    }
  }

  pub fn from_config(queue: Arc<QueueStore>, network: Arc<N>, config: &Config) -> Result<Self> {
    Ok(Self::new(
      queue,
      network,
      config.origin.clone(),
      config.resolve(&config.sync.endpoint)?,
      config.sync.tag.clone(),
    ))
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  /// Handle a form submission attempt.
  ///
  /// Online, the form goes straight to the server. Offline, it is queued and
  /// acknowledged. If the queue itself is unusable the form is sent through
  /// the online path anyway rather than dropped.
  pub async fn submit(&self, form: FormSubmission, online: bool) -> Result<SubmitOutcome> {
    if online {
      let status = self.deliver(&form.fields, &form.auth_token).await?;
      return Ok(SubmitOutcome::Delivered { status });
    }

    match self.queue_offline(&form) {
      Ok(ack) => Ok(SubmitOutcome::Queued(ack)),
      Err(OfflineError::StorageUnavailable(reason)) => {
        error!(%reason, "Could not save submission for later, submitting normally");
        let status = self.deliver(&form.fields, &form.auth_token).await?;
        Ok(SubmitOutcome::Delivered { status })
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Save a submission and ask for a deferred sync.
  pub fn queue_offline(&self, form: &FormSubmission) -> crate::error::Result<Acknowledgement> {
    let id = self.queue.enqueue(&form.fields, &form.auth_token)?;

    // The entry is safe at this point; a failed registration only delays it
    // until the next manual or connectivity-triggered sync.
    if let Err(e) = self.queue.register_sync(&self.tag) {
      warn!(id, tag = %self.tag, error = %e, "Failed to register deferred sync");
    }

    let redirect = self
      .origin
      .join(form.success_url.as_deref().unwrap_or("/"))
      .unwrap_or_else(|_| self.origin.clone());

    info!(id, tag = %self.tag, "Submission queued for background sync");
    Ok(Acknowledgement {
      id,
      message: QUEUED_MESSAGE.to_string(),
      redirect,
    })
  }

  /// POST one payload to the replay endpoint. Returns the 2xx status.
  pub async fn deliver(&self, payload: &Payload, auth_token: &str) -> crate::error::Result<u16> {
    let request = FetchRequest::post_json(self.endpoint.clone(), payload)?
      .with_header(CSRF_HEADER, auth_token);

    let response = self.network.fetch(request).await?;
    if response.is_success() {
      Ok(response.status)
    } else {
      Err(OfflineError::from_status(response.status))
    }
  }

  /// Wake event from the host. Events for other tags are ignored.
  pub async fn handle_sync(&self, tag: &str) -> Option<DrainReport> {
    if tag != self.tag {
      return None;
    }
    Some(self.drain().await)
  }

  /// Replay every queued submission, one at a time.
  ///
  /// Failures stay at the entry they happened on: the entry is kept for the
  /// next wake event and the rest of the queue is still attempted.
  pub async fn drain(&self) -> DrainReport {
    let mut report = DrainReport::default();

    let entries = match self.queue.list_all() {
      Ok(entries) => entries,
      Err(e) => {
        error!(error = %e, "Error in background sync, will retry on next wake");
        report.error = Some(e.to_string());
        return report;
      }
    };

    if entries.is_empty() {
      return report;
    }
    info!(pending = entries.len(), "Syncing queued submissions");

    for entry in &entries {
      match self.deliver(&entry.payload, &entry.auth_token).await {
        Ok(_) => match self.queue.remove(entry.id) {
          Ok(()) => report.delivered.push(entry.id),
          Err(e) => {
            // Delivered but still queued: the next wake sends it again.
            error!(id = entry.id, error = %e, "Failed to remove delivered submission");
            report.retained.push((entry.id, e.to_string()));
          }
        },
        Err(e @ OfflineError::StaleCredential { .. }) => {
          warn!(
            id = entry.id,
            captured_at = %entry.captured_at,
            error = %e,
            "Server refused stored anti-forgery token"
          );
          report.retained.push((entry.id, e.to_string()));
        }
        Err(e) => {
          warn!(id = entry.id, error = %e, "Failed to sync submission");
          report.retained.push((entry.id, e.to_string()));
        }
      }
    }

    info!(
      delivered = report.delivered.len(),
      retained = report.retained.len(),
      "Background sync finished"
    );
    report
  }
}
