//! Offline worker: seeds a named cache from the asset manifest and serves
//! intercepted requests cache-first.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::types::{CacheRequest, CachedEntry, FetchOutcome, RequestKey};
use crate::network::Network;

/// Lifecycle of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Seeding in progress, or not yet attempted
  Installing,
  /// Every manifest entry is stored in the current generation
  Installed,
  /// Old generations pruned; serving
  Active,
  /// Install failed; this instance never activates
  Redundant,
}

/// Cache-first request handler bound to one cache generation.
///
/// The handler is stateless apart from its manifest, its cache name and the
/// lifecycle state. Interceptions only read the store; the store is written
/// once, at install, in a single batch.
pub struct OfflineWorker<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: N,
  cache_name: String,
  manifest: Vec<String>,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage, N: Network> OfflineWorker<S, N> {
  pub fn new(storage: S, network: N, cache_name: impl Into<String>, manifest: Vec<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      network,
      cache_name: cache_name.into(),
      manifest,
      state: Mutex::new(WorkerState::Installing),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn state(&self) -> Result<WorkerState> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(*state)
  }

  fn set_state(&self, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let previous = *state;
    debug!(from = ?previous, to = ?next, "Worker state change");
    *state = next;
    Ok(())
  }

  /// Pick up a generation seeded by an earlier run.
  ///
  /// Returns true (and moves to `Installed`) if the current cache already
  /// exists, so install can be skipped.
  pub fn resume(&self) -> Result<bool> {
    if self.state()? != WorkerState::Installing {
      return Ok(false);
    }
    if self.storage.has_cache(&self.cache_name)? {
      info!(cache = %self.cache_name, "Found installed cache");
      self.set_state(WorkerState::Installed)?;
      return Ok(true);
    }
    Ok(false)
  }

  /// Seed the current generation with every manifest entry.
  ///
  /// All entries are fetched first and committed in one batch, so a failure
  /// anywhere leaves nothing from this attempt in the store. No retries.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(WorkerState::Installing)?;
    info!(
      cache = %self.cache_name,
      assets = self.manifest.len(),
      "Seeding offline cache"
    );

    match self.seed().await {
      Ok(count) => {
        self.set_state(WorkerState::Installed)?;
        info!(cache = %self.cache_name, count, "Offline cache installed");
        Ok(count)
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant)?;
        warn!(cache = %self.cache_name, error = %e, "Install failed");
        Err(e)
      }
    }
  }

  async fn seed(&self) -> Result<usize> {
    let fetches = self.manifest.iter().map(|url| async move {
      let request = CacheRequest::get(url);
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.key, e))?;

      if !response.is_success() {
        return Err(eyre!(
          "Failed to fetch {}: status {}",
          request.key,
          response.status
        ));
      }

      debug!(key = %request.key, bytes = response.body.len(), "Fetched manifest entry");
      Ok((request.key, response))
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(&self.cache_name, &entries)?;

    Ok(entries.len())
  }

  /// Prune every generation other than the current one.
  ///
  /// Only allowed once install has succeeded. Returns the deleted names.
  pub fn activate(&self) -> Result<Vec<String>> {
    match self.state()? {
      WorkerState::Installed | WorkerState::Active => {}
      other => {
        return Err(eyre!(
          "Cannot activate {}: worker is {:?}",
          self.cache_name,
          other
        ))
      }
    }

    let stale: Vec<String> = self
      .storage
      .cache_names()?
      .into_iter()
      .map(|summary| summary.name)
      .filter(|name| name != &self.cache_name)
      .collect();

    for name in &stale {
      self.storage.delete_cache(name)?;
      info!(cache = %name, "Deleted stale cache");
    }

    self.set_state(WorkerState::Active)?;
    info!(cache = %self.cache_name, "Offline cache active");

    Ok(stale)
  }

  /// Serve one intercepted request.
  ///
  /// A stored entry is returned without touching the network. Otherwise the
  /// request goes to the network exactly once and the live response is
  /// returned as-is, without being stored. A network failure on a miss is
  /// returned as an error.
  pub async fn handle_fetch(&self, request: &CacheRequest) -> Result<FetchOutcome> {
    if let Some(entry) = self.storage.match_entry(&self.cache_name, &request.key)? {
      debug!(key = %request.key, "Cache hit");
      return Ok(FetchOutcome::from_cache(entry.response));
    }

    debug!(key = %request.key, "Cache miss");
    let response = self.network.fetch(request).await?;
    Ok(FetchOutcome::from_network(response))
  }

  /// Look up a stored entry in the current generation without fetching.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.storage.match_entry(&self.cache_name, key)
  }
}
