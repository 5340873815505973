//! Namespace versioning, install-time precaching, activation cleanup and
//! size-budget eviction.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::CacheStorage;
use crate::config::{BudgetConfig, CacheConfig};
use crate::http::{Network, Request};
use crate::images::ImageStore;

/// The active namespace names, one per content class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
  pub static_assets: String,
  pub dynamic: String,
  pub images: String,
}

impl NamespaceSet {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{prefix}-static-{version}"),
      dynamic: format!("{prefix}-dynamic-{version}"),
      images: format!("{prefix}-images-{version}"),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.prefix, &config.version)
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_assets, &self.dynamic, &self.images]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.all().contains(&name)
  }

  /// Byte budget of an active namespace.
  pub fn budget_of(&self, name: &str, budgets: &BudgetConfig) -> Option<u64> {
    if name == self.static_assets {
      Some(budgets.static_assets)
    } else if name == self.dynamic {
      Some(budgets.dynamic)
    } else if name == self.images {
      Some(budgets.images)
    } else {
      None
    }
  }
}

/// Entries evicted from one namespace during a budget sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
  pub namespace: String,
  pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceStats {
  pub namespace: String,
  pub entries: usize,
  pub estimated_bytes: u64,
  pub budget: Option<u64>,
}

/// Governs namespace creation, supersession and eviction.
pub struct CacheLifecycle {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  images: Arc<dyn ImageStore>,
  names: NamespaceSet,
  budgets: BudgetConfig,
  average_entry_bytes: u64,
  precache: Vec<Url>,
}

impl CacheLifecycle {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    images: Arc<dyn ImageStore>,
    config: &CacheConfig,
    origin: &Url,
  ) -> Result<Self> {
    let precache = config
      .precache
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid precache path '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      storage,
      network,
      images,
      names: NamespaceSet::from_config(config),
      budgets: config.budgets,
      average_entry_bytes: config.average_entry_bytes,
      precache,
    })
  }

  pub fn names(&self) -> &NamespaceSet {
    &self.names
  }

  /// Fetch the precache manifest into the static namespace.
  ///
  /// All-or-nothing: if any asset fails to fetch or answers non-2xx, nothing
  /// is written and the install fails.
  pub async fn install(&self) -> Result<usize> {
    let requests: Vec<Request> = self.precache.iter().cloned().map(Request::get).collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    }))
    .await?;

    self.storage.open(&self.names.static_assets)?;
    for (request, response) in requests.iter().zip(&responses) {
      self
        .storage
        .put(&self.names.static_assets, &request.cache_key(), response)?;
    }

    tracing::info!(
      namespace = %self.names.static_assets,
      assets = responses.len(),
      "precache installed"
    );
    Ok(responses.len())
  }

  /// Delete every namespace that doesn't belong to the current version.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.namespaces()? {
      if self.names.contains(&name) {
        continue;
      }
      if self.storage.delete_namespace(&name)? {
        tracing::info!(namespace = %name, "stale namespace deleted");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Evict the oldest quarter of any namespace over its byte budget, and
  /// purge expired image store records.
  ///
  /// Occupancy is estimated as entry count times an average entry size.
  pub fn enforce_budgets(&self) -> Result<Vec<Eviction>> {
    let mut evictions = Vec::new();

    for name in self.storage.namespaces()? {
      let Some(budget) = self.names.budget_of(&name, &self.budgets) else {
        continue;
      };

      let keys = self.storage.keys(&name)?;
      let estimated = (keys.len() as u64).saturating_mul(self.average_entry_bytes);
      if estimated <= budget {
        continue;
      }

      let to_evict = (keys.len() / 4).max(1);
      let evicted = self.storage.delete_entries(&name, &keys[..to_evict])?;
      tracing::info!(namespace = %name, evicted, estimated, budget, "namespace over budget");
      evictions.push(Eviction {
        namespace: name,
        evicted,
      });
    }

    let purged = self.images.purge_expired()?;
    if purged > 0 {
      tracing::info!(purged, "expired images purged");
    }

    Ok(evictions)
  }

  /// Run `enforce_budgets` on a fixed interval.
  pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let lifecycle = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
      loop {
        ticker.tick().await;
        if let Err(e) = lifecycle.enforce_budgets() {
          tracing::warn!(error = %e, "budget sweep failed");
        }
      }
    })
  }

  pub fn stats(&self) -> Result<Vec<NamespaceStats>> {
    self
      .storage
      .namespaces()?
      .into_iter()
      .map(|name| {
        let entries = self.storage.entry_count(&name)?;
        Ok(NamespaceStats {
          budget: self.names.budget_of(&name, &self.budgets),
          estimated_bytes: (entries as u64).saturating_mul(self.average_entry_bytes),
          entries,
          namespace: name,
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use crate::images::{CachedImage, SqliteImageStore};
  use crate::testing::MockNetwork;

  fn origin() -> Url {
    Url::parse("https://app.test").unwrap()
  }

  fn lifecycle_with(
    network: Arc<MockNetwork>,
    config: &CacheConfig,
  ) -> (CacheLifecycle, Arc<SqliteStorage>, Arc<SqliteImageStore>) {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let images = Arc::new(SqliteImageStore::in_memory());
    let lifecycle = CacheLifecycle::new(
      storage.clone(),
      network,
      images.clone(),
      config,
      &origin(),
    )
    .unwrap();
    (lifecycle, storage, images)
  }

  fn small_config() -> CacheConfig {
    CacheConfig {
      precache: vec!["/index.html".into(), "/offline.html".into()],
      ..CacheConfig::default()
    }
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let network = Arc::new(MockNetwork::new());
    network.respond("https://app.test/index.html", Response::new(200, "<html>"));
    network.respond("https://app.test/offline.html", Response::new(200, "offline"));
    let (lifecycle, storage, _) = lifecycle_with(network, &small_config());

    assert_eq!(lifecycle.install().await.unwrap(), 2);
    let key = Request::get(origin().join("/offline.html").unwrap()).cache_key();
    assert!(storage
      .match_request(&lifecycle.names().static_assets, &key)
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = Arc::new(MockNetwork::new());
    network.respond("https://app.test/index.html", Response::new(200, "<html>"));
    // offline.html answers 404
    let (lifecycle, storage, _) = lifecycle_with(network, &small_config());

    assert!(lifecycle.install().await.is_err());
    assert_eq!(
      storage
        .entry_count(&lifecycle.names().static_assets)
        .unwrap(),
      0
    );
  }

  #[test]
  fn test_activate_deletes_old_versions_once() {
    let network = Arc::new(MockNetwork::new());
    let (lifecycle, storage, _) = lifecycle_with(network, &small_config());
    let old = NamespaceSet::new("slideshow", "v0");
    for name in old.all() {
      storage.put(name, "GET /x", &Response::new(200, "x")).unwrap();
    }
    storage.open(&lifecycle.names().dynamic).unwrap();

    let mut deleted = lifecycle.activate().unwrap();
    deleted.sort();
    let mut expected: Vec<String> = old.all().iter().map(|s| s.to_string()).collect();
    expected.sort();
    assert_eq!(deleted, expected);

    assert!(lifecycle.activate().unwrap().is_empty());
    assert_eq!(storage.namespaces().unwrap(), vec![lifecycle.names().dynamic.clone()]);
  }

  #[test]
  fn test_budget_sweep_evicts_oldest_quarter() {
    let network = Arc::new(MockNetwork::new());
    let mut config = small_config();
    config.average_entry_bytes = 100;
    config.budgets.dynamic = 500;
    let (lifecycle, storage, _) = lifecycle_with(network, &config);
    let dynamic = lifecycle.names().dynamic.clone();
    let static_ns = lifecycle.names().static_assets.clone();

    for i in 0..8 {
      storage
        .put(&dynamic, &format!("GET /{i}"), &Response::new(200, "x"))
        .unwrap();
    }
    storage.put(&static_ns, "GET /app.js", &Response::new(200, "x")).unwrap();

    let evictions = lifecycle.enforce_budgets().unwrap();
    assert_eq!(
      evictions,
      vec![Eviction {
        namespace: dynamic.clone(),
        evicted: 2
      }]
    );
    assert_eq!(storage.keys(&dynamic).unwrap()[0], "GET /2");
    assert_eq!(storage.entry_count(&static_ns).unwrap(), 1);
  }

  #[test]
  fn test_budget_sweep_purges_expired_images() {
    let network = Arc::new(MockNetwork::new());
    let (lifecycle, _, images) = lifecycle_with(network, &small_config());
    images
      .put(
        &CachedImage::new("1", vec![1], "image/png")
          .with_expiry(chrono::Utc::now() - chrono::Duration::seconds(5)),
      )
      .unwrap();

    lifecycle.enforce_budgets().unwrap();
    assert_eq!(images.count().unwrap(), 0);
  }

  #[test]
  fn test_stats() {
    let network = Arc::new(MockNetwork::new());
    let (lifecycle, storage, _) = lifecycle_with(network, &small_config());
    let images_ns = lifecycle.names().images.clone();
    storage.put(&images_ns, "GET /1.jpg", &Response::new(200, "x")).unwrap();

    let stats = lifecycle.stats().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].entries, 1);
    assert_eq!(stats[0].estimated_bytes, 50 * 1024);
    assert_eq!(stats[0].budget, Some(200 * 1024 * 1024));
  }

  #[test]
  fn test_huge_average_entry_size_saturates() {
    let network = Arc::new(MockNetwork::new());
    let mut config = small_config();
    config.average_entry_bytes = u64::MAX;
    let (lifecycle, storage, _) = lifecycle_with(network, &config);
    let dynamic = lifecycle.names().dynamic.clone();
    for i in 0..2 {
      storage
        .put(&dynamic, &format!("GET /{i}"), &Response::new(200, "x"))
        .unwrap();
    }

    let stats = lifecycle.stats().unwrap();
    assert_eq!(stats[0].estimated_bytes, u64::MAX);

    let evictions = lifecycle.enforce_budgets().unwrap();
    assert_eq!(evictions[0].evicted, 1);
    assert_eq!(storage.keys(&dynamic).unwrap(), vec!["GET /1".to_string()]);
  }
}
