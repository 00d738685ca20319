//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::net::{Fetcher, Request, RequestKey, ResponseSnapshot};

use super::storage::CacheStorage;
use super::types::{Resolved, Strategy};

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy works over a single partition name and a single request.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  /// Create a new cache layer with the given storage backend and fetcher.
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self { storage, fetcher }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Run `strategy` for `request` against `partition`.
  pub async fn resolve(
    &self,
    strategy: Strategy,
    partition: &str,
    request: &Request,
  ) -> Result<Resolved, WorkerError> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(partition, request).await,
      Strategy::NetworkFirst => self.network_first(partition, request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(partition, request).await,
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if present, return without touching the network
  /// 2. Otherwise fetch, store a copy, return the network response
  pub async fn cache_first(&self, partition: &str, request: &Request) -> Result<Resolved, WorkerError> {
    let key = RequestKey::for_request(request);

    if let Some(cached) = self.storage.get(partition, &key)? {
      debug!(url = %request.url, partition, cached_at = %cached.cached_at, "cache hit");
      return Ok(Resolved::from_cache(cached.response));
    }

    let response = self.fetcher.fetch(request).await?;
    self.store(partition, &key, &response);
    Ok(Resolved::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch - on success store a copy and return it
  /// 2. On network failure, return the cached copy (offline mode)
  pub async fn network_first(
    &self,
    partition: &str,
    request: &Request,
  ) -> Result<Resolved, WorkerError> {
    let key = RequestKey::for_request(request);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(partition, &key, &response);
        Ok(Resolved::from_network(response))
      }
      Err(err) => match self.storage.get(partition, &key)? {
        Some(cached) => {
          debug!(url = %request.url, partition, error = %err, "network failed, serving cache");
          Ok(Resolved::offline(cached.response))
        }
        None => Err(err),
      },
    }
  }

  /// Fetch with stale-while-revalidate strategy.
  ///
  /// A cached copy is returned at once while a background fetch refreshes it
  /// for next time. Without a cached copy the caller waits on the network.
  pub async fn stale_while_revalidate(
    &self,
    partition: &str,
    request: &Request,
  ) -> Result<Resolved, WorkerError> {
    let key = RequestKey::for_request(request);

    match self.storage.get(partition, &key)? {
      Some(cached) => {
        let revalidation = self.spawn_revalidation(partition.to_string(), key, request.clone());
        Ok(Resolved::revalidating(cached.response, revalidation))
      }
      None => {
        let response = self.fetcher.fetch(request).await?;
        self.store(partition, &key, &response);
        Ok(Resolved::from_network(response))
      }
    }
  }

  fn spawn_revalidation(&self, partition: String, key: RequestKey, request: Request) -> JoinHandle<()> {
    let layer = self.clone();

    tokio::spawn(async move {
      match layer.fetcher.fetch(&request).await {
        Ok(response) => layer.store(&partition, &key, &response),
        Err(err) => debug!(url = %request.url, error = %err, "revalidation failed, keeping cached copy"),
      }
    })
  }

  /// Store a copy of a successful response. Failures are logged, not returned:
  /// the caller already holds the network response.
  fn store(&self, partition: &str, key: &RequestKey, response: &ResponseSnapshot) {
    if !response.is_ok() {
      debug!(url = key.url(), status = response.status, "not caching non-2xx response");
      return;
    }

    if let Err(e) = self.storage.put(partition, key, response) {
      warn!(url = key.url(), partition, error = %e, "failed to write cache entry");
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}
