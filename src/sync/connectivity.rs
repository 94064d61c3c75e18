//! Online/offline detection.

use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::net::{FetchRequest, Network};

/// Decides whether the site is reachable by requesting a cheap page.
///
/// Any HTTP answer counts as online; only transport failures and timeouts
/// count as offline.
pub struct ConnectivityProbe<N: Network> {
  network: Arc<N>,
  url: Url,
  timeout: Duration,
}

impl<N: Network> ConnectivityProbe<N> {
  pub fn new(network: Arc<N>, url: Url, timeout: Duration) -> Self {
    Self {
      network,
      url,
      timeout,
    }
  }

  pub async fn is_online(&self) -> bool {
    let request = FetchRequest::get(self.url.clone()).with_header("Cache-Control", "no-cache");
    matches!(
      tokio::time::timeout(self.timeout, self.network.fetch(request)).await,
      Ok(Ok(_))
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Turns a stream of probe results into transitions.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
  last: Option<bool>,
}

impl ConnectivityMonitor {
  /// Record a probe result. The first observation always counts as a
  /// transition so a host starting up online wakes pending work.
  pub fn observe(&mut self, online: bool) -> Option<Transition> {
    let previous = self.last.replace(online);
    if previous == Some(online) {
      return None;
    }
    Some(if online {
      Transition::WentOnline
    } else {
      Transition::WentOffline
    })
  }

  pub fn is_online(&self) -> Option<bool> {
    self.last
  }
}
