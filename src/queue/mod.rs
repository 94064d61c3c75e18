//! Local durable queue of form submissions made while offline.
//!
//! Entries are keyed by an auto-assigned id that is never reused, read in
//! bulk when connectivity returns and deleted one by one once the server
//! accepts them. The same database also records deferred-sync registrations.

mod registry;
mod schema;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use store::QueueStore;

/// Form field name to value, captured verbatim.
pub type Payload = BTreeMap<String, String>;

/// One form submission waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSubmission {
  pub id: i64,
  pub payload: Payload,
  /// Anti-forgery token as it was when the form was submitted
  pub auth_token: String,
  pub captured_at: DateTime<Utc>,
}
