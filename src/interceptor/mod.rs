//! Tiered fetch interceptor.
//!
//! Every read request is classified and answered by the matching strategy:
//! - Static assets: cache-first against the static namespace
//! - Images: image store, then the images namespace, then the network
//! - API calls: network-first against the dynamic namespace
//! - Everything else: stale-while-revalidate against the dynamic namespace
//!
//! When a strategy fails, navigations get the offline page and other
//! requests get any cached copy before the error is returned.

mod classify;
mod image;

pub use classify::{Classifier, RequestClass};
pub use image::{ImageStrategy, SERVED_FROM_HEADER};

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheLayer, CacheSource, Served};
use crate::config::CacheConfig;
use crate::connectivity::Connectivity;
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::images::ImageStore;
use crate::lifecycle::NamespaceSet;

/// Header set on a synthesized offline placeholder.
pub const FALLBACK_HEADER: &str = "x-cache-fallback";

pub struct FetchInterceptor {
  layer: CacheLayer,
  images: ImageStrategy,
  classifier: Classifier,
  names: NamespaceSet,
  connectivity: Connectivity,
  offline_page: Url,
}

impl FetchInterceptor {
  pub fn new(
    layer: CacheLayer,
    image_store: Arc<dyn ImageStore>,
    connectivity: Connectivity,
    config: &CacheConfig,
    origin: &Url,
  ) -> Result<Self> {
    let names = NamespaceSet::from_config(config);
    let offline_page = origin
      .join(&config.offline_page)
      .map_err(|e| eyre!("Invalid offline page '{}': {}", config.offline_page, e))?;

    Ok(Self {
      images: ImageStrategy::new(layer.clone(), image_store, names.images.clone()),
      classifier: Classifier::new(config)?,
      layer,
      names,
      connectivity,
      offline_page,
    })
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self.classifier.classify(request)
  }

  /// Answer a request from the best available tier.
  pub async fn handle(&self, request: &Request) -> Result<Served, FetchError> {
    let class = self.classifier.classify(request);
    tracing::trace!(request = %request.cache_key(), ?class, "intercepted");

    let outcome = match class {
      RequestClass::PassThrough => {
        let response = self.layer.network().fetch(request).await?;
        return Ok(Served::with_source(response, CacheSource::PassThrough));
      }
      RequestClass::Static => self.layer.cache_first(&self.names.static_assets, request).await,
      RequestClass::Image => {
        let id = self.classifier.extract_image_id(request.url.path());
        self.images.serve(request, id.as_deref()).await
      }
      RequestClass::Api => self.layer.network_first(&self.names.dynamic, request).await,
      RequestClass::Other => {
        self
          .layer
          .stale_while_revalidate(&self.names.dynamic, request)
          .await
      }
    };

    match outcome {
      Ok(served) => Ok(served),
      Err(err) => self.fallback(request, err),
    }
  }

  fn fallback(&self, request: &Request, err: FetchError) -> Result<Served, FetchError> {
    let key = request.cache_key();
    tracing::debug!(request = %key, error = %err, "strategy failed, falling back");

    if request.is_navigation() {
      return Ok(self.offline_page());
    }

    match self.layer.storage().match_any(&key) {
      Ok(Some(cached)) => Ok(Served::offline(cached)),
      Ok(None) => Err(err),
      Err(e) => {
        tracing::warn!(request = %key, error = %e, "fallback lookup failed");
        Err(err)
      }
    }
  }

  /// The cached offline page, or a synthesized 503 when it was never cached.
  fn offline_page(&self) -> Served {
    let key = Request::get(self.offline_page.clone()).cache_key();
    match self
      .layer
      .storage()
      .match_request(&self.names.static_assets, &key)
    {
      Ok(Some(page)) => return Served::with_source(page, CacheSource::OfflinePage),
      Ok(None) => {}
      Err(e) => tracing::warn!(error = %e, "offline page lookup failed"),
    }

    let reason = if self.connectivity.is_online() {
      "unavailable"
    } else {
      "offline"
    };
    let response = Response::new(503, format!("This page is {reason}. Please try again later."))
      .with_header("content-type", "text/plain; charset=utf-8")
      .with_header(FALLBACK_HEADER, reason);
    Served::with_source(response, CacheSource::OfflinePage)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::connectivity::ConnectivityMonitor;
  use crate::http::Method;
  use crate::images::{CachedImage, SqliteImageStore};
  use crate::testing::MockNetwork;
  use std::time::Duration;

  struct Fixture {
    interceptor: FetchInterceptor,
    network: Arc<MockNetwork>,
    storage: Arc<SqliteStorage>,
    images: Arc<SqliteImageStore>,
    monitor: ConnectivityMonitor,
  }

  fn fixture() -> Fixture {
    let network = Arc::new(MockNetwork::new());
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let images = Arc::new(SqliteImageStore::in_memory());
    let monitor = ConnectivityMonitor::new(true);
    let interceptor = FetchInterceptor::new(
      CacheLayer::new(storage.clone(), network.clone()),
      images.clone(),
      monitor.handle(),
      &CacheConfig::default(),
      &Url::parse("https://app.test").unwrap(),
    )
    .unwrap();
    Fixture {
      interceptor,
      network,
      storage,
      images,
      monitor,
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_image_store_hit_never_reaches_network() {
    let f = fixture();
    f.network.set_offline(true);
    f.images
      .put(&CachedImage::new("1234", vec![0xff, 0xd8], "image/jpeg"))
      .unwrap();

    let served = f
      .interceptor
      .handle(&get("https://app.test/images/1234.jpg"))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::ImageStore);
    assert_eq!(served.response.body.as_ref(), &[0xff, 0xd8]);
    assert_eq!(f.network.calls(), 0);
  }

  #[tokio::test]
  async fn test_static_assets_are_cache_first() {
    let f = fixture();
    let url = "https://app.test/assets/app.css";
    f.network.respond(url, Response::new(200, "body{}"));

    let first = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(f.network.calls(), 1);
  }

  #[tokio::test]
  async fn test_non_2xx_static_response_is_not_stored() {
    let f = fixture();
    let url = "https://app.test/assets/missing.js";

    let served = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(served.response.status, 404);
    assert_eq!(f.storage.entry_count("slideshow-static-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_api_is_network_first_with_offline_fallback() {
    let f = fixture();
    let url = "https://app.test/api/playlists";
    f.network.respond(url, Response::new(200, "[1]"));
    assert_eq!(
      f.interceptor.handle(&get(url)).await.unwrap().source,
      CacheSource::Network
    );

    f.network.respond(url, Response::new(200, "[1,2]"));
    let fresh = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(fresh.response.body.as_ref(), b"[1,2]");

    f.network.set_offline(true);
    let offline = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.response.body.as_ref(), b"[1,2]");
  }

  #[tokio::test]
  async fn test_other_requests_revalidate_in_background() {
    let f = fixture();
    let url = "https://app.test/slideshow/3";
    f.network.respond(url, Response::new(200, "v1"));
    f.interceptor.handle(&get(url)).await.unwrap();

    f.network.respond(url, Response::new(200, "v2"));
    let stale = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(stale.source, CacheSource::CacheRevalidating);
    assert_eq!(stale.response.body.as_ref(), b"v1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let refreshed = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(refreshed.response.body.as_ref(), b"v2");
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_cached_answer() {
    let f = fixture();
    let url = "https://app.test/slideshow/4";
    f.network.respond(url, Response::new(200, "cached"));
    f.interceptor.handle(&get(url)).await.unwrap();

    f.network.set_offline(true);
    let served = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(served.response.body.as_ref(), b"cached");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let again = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(again.response.body.as_ref(), b"cached");
  }

  #[tokio::test]
  async fn test_navigation_gets_cached_offline_page() {
    let f = fixture();
    f.storage
      .put(
        "slideshow-static-v1",
        "GET https://app.test/offline.html",
        &Response::new(200, "<h1>offline</h1>"),
      )
      .unwrap();
    f.network.set_offline(true);

    let served = f
      .interceptor
      .handle(&Request::navigate(Url::parse("https://app.test/playlists/9").unwrap()))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::OfflinePage);
    assert_eq!(served.response.body.as_ref(), b"<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_navigation_without_offline_page_gets_placeholder() {
    let f = fixture();
    f.network.set_offline(true);
    f.monitor.set_online(false);

    let served = f
      .interceptor
      .handle(&Request::navigate(Url::parse("https://app.test/playlists/9").unwrap()))
      .await
      .unwrap();
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.header(FALLBACK_HEADER), Some("offline"));
  }

  #[tokio::test]
  async fn test_fallback_uses_any_namespace() {
    let f = fixture();
    let url = "https://app.test/assets/legacy.js";
    // cached under the dynamic namespace by an earlier version of the rules
    f.storage
      .put("slideshow-dynamic-v1", &get(url).cache_key(), &Response::new(200, "old"))
      .unwrap();
    f.network.set_offline(true);

    let served = f.interceptor.handle(&get(url)).await.unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body.as_ref(), b"old");
  }

  #[tokio::test]
  async fn test_total_miss_propagates_for_subresources() {
    let f = fixture();
    f.network.set_offline(true);
    let result = f.interceptor.handle(&get("https://app.test/api/albums")).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
  }

  #[tokio::test]
  async fn test_writes_pass_through_uncached() {
    let f = fixture();
    let url = "https://app.test/api/albums";
    f.network.respond(url, Response::new(201, "created"));
    let mut request = get(url);
    request.method = Method::Post;

    let served = f.interceptor.handle(&request).await.unwrap();
    assert_eq!(served.source, CacheSource::PassThrough);
    assert!(f.storage.namespaces().unwrap().is_empty());
  }
}
