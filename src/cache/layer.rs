//! Cache layer that orchestrates namespace lookups with network fetching.

use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::Served;
use crate::error::FetchError;
use crate::http::{Network, Request, Response};

/// Cache layer implementing the per-namespace fetch strategies.
///
/// This layer sits between the interceptor and the network, writing
/// successful responses back into the namespace it was asked to use.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
}

impl CacheLayer {
  pub fn new(storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
    Self { storage, network }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  /// Cache-first.
  ///
  /// 1. Return a cached match if present
  /// 2. Otherwise fetch, storing a copy of a 2xx response
  pub async fn cache_first(&self, namespace: &str, request: &Request) -> Result<Served, FetchError> {
    let key = request.cache_key();
    if let Some(cached) = self.storage.match_request(namespace, &key)? {
      return Ok(Served::from_cache(cached, false));
    }

    let response = self.network.fetch(request).await?;
    self.store(namespace, &key, &response);
    Ok(Served::from_network(response))
  }

  /// Network-first.
  ///
  /// 1. Try the network, storing a copy of a 2xx response
  /// 2. On network failure, serve any cached match (offline mode)
  /// 3. With nothing cached, the network error propagates
  pub async fn network_first(
    &self,
    namespace: &str,
    request: &Request,
  ) -> Result<Served, FetchError> {
    let key = request.cache_key();
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(namespace, &key, &response);
        Ok(Served::from_network(response))
      }
      Err(err) => {
        tracing::debug!(request = %key, error = %err, "network failed, trying cache");
        match self.storage.match_request(namespace, &key)? {
          Some(cached) => Ok(Served::offline(cached)),
          None => Err(err),
        }
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A cached match is returned at once while a detached task refreshes the
  /// namespace. The refresh outcome never reaches the caller. Without a
  /// cached match the network fetch is awaited.
  pub async fn stale_while_revalidate(
    &self,
    namespace: &str,
    request: &Request,
  ) -> Result<Served, FetchError> {
    let key = request.cache_key();
    let cached = self.storage.match_request(namespace, &key)?;

    if let Some(cached) = cached {
      let storage = Arc::clone(&self.storage);
      let network = Arc::clone(&self.network);
      let request = request.clone();
      let namespace = namespace.to_string();
      tokio::spawn(async move {
        match network.fetch(&request).await {
          Ok(response) if response.is_ok() => {
            if let Err(e) = storage.put(&namespace, &key, &response) {
              tracing::debug!(request = %key, error = %e, "background refresh not stored");
            }
          }
          Ok(response) => {
            tracing::debug!(request = %key, status = response.status, "background refresh not cacheable");
          }
          Err(e) => {
            tracing::debug!(request = %key, error = %e, "background refresh failed");
          }
        }
      });
      return Ok(Served::from_cache(cached, true));
    }

    let response = self.network.fetch(request).await?;
    self.store(namespace, &key, &response);
    Ok(Served::from_network(response))
  }

  /// Write a 2xx response into a namespace. A failed write never fails the request.
  pub fn store(&self, namespace: &str, key: &str, response: &Response) {
    if !response.is_ok() {
      return;
    }
    if let Err(e) = self.storage.put(namespace, key, response) {
      tracing::warn!(namespace, request = key, error = %e, "failed to cache response");
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
    }
  }
}
