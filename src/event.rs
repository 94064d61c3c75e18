use std::time::Duration;
use tokio::sync::mpsc;

use crate::net::Network;
use crate::sync::ConnectivityProbe;

/// Host events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
  /// Result of a periodic connectivity probe
  Connectivity(bool),
  /// Ctrl-C
  Shutdown,
}

/// Event handler that produces events from a connectivity probe and Ctrl-C
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
  /// Create a new event handler probing every `interval`
  pub fn new<N: Network>(probe: ConnectivityProbe<N>, interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn connectivity poller
    let probe_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let online = probe.is_online().await;
        if probe_tx.send(HostEvent::Connectivity(online)).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(HostEvent::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}
