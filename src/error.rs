/// Failures of the offline submission pipeline.
///
/// Only `StorageUnavailable` ever reaches the user, and only at enqueue time.
/// Everything that happens during a background replay is logged and the
/// entry stays queued.
#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
  #[error("Durable store unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Server rejected delivery with status {status}")]
  DeliveryRejected { status: u16 },

  #[error("Anti-forgery token refused with status {status}")]
  StaleCredential { status: u16 },
}

impl From<rusqlite::Error> for OfflineError {
  fn from(e: rusqlite::Error) -> Self {
    OfflineError::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for OfflineError {
  fn from(e: serde_json::Error) -> Self {
    OfflineError::StorageUnavailable(format!("corrupt queue entry: {}", e))
  }
}

impl From<reqwest::Error> for OfflineError {
  fn from(e: reqwest::Error) -> Self {
    OfflineError::NetworkUnavailable(e.to_string())
  }
}

impl OfflineError {
  /// Classify a non-success replay status.
  ///
  /// The server answers a rejected CSRF token with 403.
  pub fn from_status(status: u16) -> Self {
    if status == 403 {
      OfflineError::StaleCredential { status }
    } else {
      OfflineError::DeliveryRejected { status }
    }
  }
}

pub type Result<T> = std::result::Result<T, OfflineError>;
