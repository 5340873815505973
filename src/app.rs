//! Composition root: builds every component once and hands out shared handles.

use color_eyre::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Location;
use crate::http::{HttpNetwork, Network};
use crate::images::{ImageStore, NoopImageStore, SqliteImageStore};
use crate::interceptor::{Classifier, FetchInterceptor};
use crate::lifecycle::{CacheLifecycle, NamespaceStats};
use crate::prefetch::Prefetcher;
use crate::queue::{
  ActionExecutor, HttpExecutor, OfflineQueue, QueueSettings, SqliteQueueStorage,
};

/// Where each persistent store lives.
#[derive(Debug, Clone)]
pub struct StoreLocations {
  pub images: Location,
  pub responses: Location,
  pub queue: Location,
}

impl StoreLocations {
  pub fn in_dir(dir: &Path) -> Self {
    Self {
      images: Location::file(dir, "images.db"),
      responses: Location::file(dir, "responses.db"),
      queue: Location::file(dir, "queue.db"),
    }
  }

  pub fn in_memory() -> Self {
    Self {
      images: Location::Memory,
      responses: Location::Memory,
      queue: Location::Memory,
    }
  }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
  pub namespaces: Vec<NamespaceStats>,
  pub images: usize,
  pub pending_actions: usize,
  pub failed_actions: usize,
}

/// The offline layer, wired together.
pub struct OfflineContext {
  config: Config,
  origin: Url,
  network: Arc<dyn Network>,
  images: Arc<dyn ImageStore>,
  pub interceptor: Arc<FetchInterceptor>,
  pub lifecycle: Arc<CacheLifecycle>,
  pub queue: OfflineQueue,
  pub connectivity: ConnectivityMonitor,
  pub prefetcher: Prefetcher,
}

impl OfflineContext {
  /// Build the production context: reqwest network, HTTP executor and
  /// SQLite stores in the data directory.
  pub fn open(config: Config) -> Result<Self> {
    let network = HttpNetwork::new()?;
    let executor = HttpExecutor::new(
      network.client().clone(),
      config.origin_url()?,
      Config::api_token(),
    );
    let locations = StoreLocations::in_dir(&config.data_dir()?);
    Self::assemble(config, Arc::new(network), Arc::new(executor), locations)
  }

  pub fn assemble(
    config: Config,
    network: Arc<dyn Network>,
    executor: Arc<dyn ActionExecutor>,
    locations: StoreLocations,
  ) -> Result<Self> {
    let origin = config.origin_url()?;

    let images: Arc<dyn ImageStore> = if config.images.enabled {
      Arc::new(SqliteImageStore::new(locations.images))
    } else {
      Arc::new(NoopImageStore)
    };
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_at(&locations.responses)?);
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&network));

    // Optimistic until the probe or a platform signal says otherwise
    let connectivity = ConnectivityMonitor::new(true);

    let interceptor = FetchInterceptor::new(
      layer,
      Arc::clone(&images),
      connectivity.handle(),
      &config.cache,
      &origin,
    )?;
    let lifecycle = CacheLifecycle::new(
      storage,
      Arc::clone(&network),
      Arc::clone(&images),
      &config.cache,
      &origin,
    )?;
    let queue = OfflineQueue::new(
      Arc::new(SqliteQueueStorage::open_at(&locations.queue)?),
      executor,
      connectivity.handle(),
      QueueSettings::from(&config.queue),
    )?;
    let default_ttl = config
      .images
      .default_ttl_secs
      .and_then(|secs| chrono::Duration::try_seconds(secs as i64));
    let prefetcher = Prefetcher::new(
      Arc::clone(&network),
      Arc::clone(&images),
      Arc::new(Classifier::new(&config.cache)?),
      default_ttl,
    );

    Ok(Self {
      config,
      origin,
      network,
      images,
      interceptor: Arc::new(interceptor),
      lifecycle: Arc::new(lifecycle),
      queue,
      connectivity,
      prefetcher,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn images(&self) -> &Arc<dyn ImageStore> {
    &self.images
  }

  /// Start the background services: budget sweeper, reconnect drain and
  /// reachability probe (each only when configured).
  pub fn start(&self) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![self
      .lifecycle
      .spawn_sweeper(self.config.cache.sweep_interval())];

    if self.config.queue.auto_process_on_reconnect {
      tasks.push(self.connectivity.spawn_reconnect_drain(self.queue.clone()));
    }

    if let Some(secs) = self.config.connectivity.probe_interval_secs {
      tasks.push(self.connectivity.spawn_probe(
        Arc::clone(&self.network),
        self.origin.clone(),
        Duration::from_secs(secs.max(1)),
      ));
    }

    tracing::info!(tasks = tasks.len(), "background services started");
    tasks
  }

  pub fn stats(&self) -> Result<CacheStats> {
    Ok(CacheStats {
      namespaces: self.lifecycle.stats()?,
      images: self.images.count()?,
      pending_actions: self.queue.pending_count(),
      failed_actions: self.queue.failed_count(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::http::{Request, Response};
  use crate::queue::{Action, ActionStatus};
  use crate::testing::{MockExecutor, MockNetwork};

  fn config() -> Config {
    let mut config = Config {
      origin: "https://app.test".to_string(),
      ..Config::default()
    };
    config.cache.precache = vec!["/index.html".into(), "/offline.html".into()];
    config.queue.retry_delay_ms = 5;
    config.queue.completed_ttl_ms = 10_000;
    config.connectivity.probe_interval_secs = None;
    config
  }

  fn context(config: Config) -> (OfflineContext, Arc<MockNetwork>, Arc<MockExecutor>) {
    let network = Arc::new(MockNetwork::new());
    let executor = Arc::new(MockExecutor::new());
    let ctx = OfflineContext::assemble(
      config,
      network.clone(),
      executor.clone(),
      StoreLocations::in_memory(),
    )
    .unwrap();
    (ctx, network, executor)
  }

  #[tokio::test]
  async fn test_prefetched_image_is_served_offline() {
    let (ctx, network, _) = context(config());
    let url = Url::parse("https://app.test/images/42.jpg").unwrap();
    network.respond(url.as_str(), Response::new(200, "jpeg bytes"));

    ctx.prefetcher.prefetch(&url, Some("lobby"), None).await.unwrap();
    network.set_offline(true);
    let calls = network.calls();

    let served = ctx.interceptor.handle(&Request::get(url)).await.unwrap();
    assert_eq!(served.source, CacheSource::ImageStore);
    assert_eq!(served.response.body.as_ref(), b"jpeg bytes");
    assert_eq!(network.calls(), calls);
  }

  #[tokio::test]
  async fn test_disabled_image_store_uses_namespace() {
    let mut config = config();
    config.images.enabled = false;
    let (ctx, network, _) = context(config);
    let url = Url::parse("https://app.test/images/42.jpg").unwrap();
    network.respond(url.as_str(), Response::new(200, "jpeg"));

    ctx.prefetcher.prefetch(&url, None, None).await.unwrap();
    assert_eq!(ctx.images().count().unwrap(), 0);

    let served = ctx.interceptor.handle(&Request::get(url)).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_install_then_offline_navigation() {
    let (ctx, network, _) = context(config());
    network.respond("https://app.test/index.html", Response::new(200, "<app>"));
    network.respond("https://app.test/offline.html", Response::new(200, "<offline>"));

    ctx.lifecycle.install().await.unwrap();
    ctx.lifecycle.activate().unwrap();
    network.set_offline(true);

    let served = ctx
      .interceptor
      .handle(&Request::navigate(Url::parse("https://app.test/albums").unwrap()))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::OfflinePage);
    assert_eq!(served.response.body.as_ref(), b"<offline>");
  }

  #[tokio::test]
  async fn test_started_context_drains_on_reconnect() {
    let (ctx, _, executor) = context(config());
    let tasks = ctx.start();
    assert_eq!(tasks.len(), 2);

    ctx.connectivity.set_online(false);
    let id = ctx
      .queue
      .add_action(Action::CreateAlbum {
        name: "Summer".into(),
        description: None,
      })
      .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(executor.calls(), 0);
    assert_eq!(ctx.stats().unwrap().pending_actions, 1);

    ctx.connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(executor.executed(), vec![id.clone()]);
    assert_eq!(ctx.queue.get(&id).unwrap().status, ActionStatus::Completed);

    for task in tasks {
      task.abort();
    }
  }
}
