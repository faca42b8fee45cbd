//! Offline asset cache.
//!
//! This module provides the cache-first request handling for the app:
//! - Seeds a named, versioned cache from a fixed asset manifest, all or nothing
//! - Serves intercepted requests from that cache, falling back to the network
//! - Prunes older cache generations on activation

mod storage;
mod types;
mod worker;

pub use storage::{CacheStorage, SqliteStorage};
pub use types::{
  header_entry, is_hop_by_hop, CacheRequest, CachedResponse, FetchSource, RequestKey,
};
pub use worker::OfflineWorker;
