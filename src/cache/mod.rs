//! Stale-while-revalidate cache for GET traffic with offline support.
//!
//! This module provides the read-through cache sitting in front of the
//! network:
//! - Serves a cached response immediately and refreshes it in the background
//! - Stores only successful same-origin (or allow-listed CDN) GET responses
//! - Falls back to a precached offline page when a navigation cannot be served
//! - Keeps responses in named generations; activating a new one purges the rest

mod layer;
mod policy;
mod storage;
mod types;

pub use layer::{CacheLayer, FetchDecision, LifecycleState};
pub use storage::{CacheStorage, SqliteStorage};
pub use types::CacheSource;
