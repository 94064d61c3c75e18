//! Push notification display and click routing. Stateless.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::PushConfig;

/// Incoming push message; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  message: Option<String>,
  url: Option<String>,
}

/// A notification ready to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Opened when the notification is clicked
  pub url: String,
}

impl Notification {
  /// Build the notification for a push event. Events without data show
  /// nothing.
  pub fn from_push(data: Option<&[u8]>, config: &PushConfig) -> Result<Option<Self>> {
    let Some(data) = data else {
      return Ok(None);
    };

    let payload: PushPayload =
      serde_json::from_slice(data).map_err(|e| eyre!("Invalid push payload: {}", e))?;

    Ok(Some(Self {
      title: non_empty(payload.title).unwrap_or_else(|| config.default_title.clone()),
      body: non_empty(payload.message).unwrap_or_else(|| config.default_message.clone()),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
      url: non_empty(payload.url).unwrap_or_else(|| "/".to_string()),
    }))
  }

  /// Where a click on this notification navigates.
  pub fn click_target(&self, origin: &Url) -> Result<Url> {
    origin
      .join(&self.url)
      .map_err(|e| eyre!("Invalid notification url '{}': {}", self.url, e))
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.is_empty())
}
