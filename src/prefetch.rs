//! Preloads images into the image store so they can be shown offline.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use url::Url;

use crate::error::FetchError;
use crate::http::{mime_for_path, Network, Request};
use crate::images::{CachedImage, ImageStore};
use crate::interceptor::Classifier;

const CONCURRENCY: usize = 4;

/// Outcome of one URL in a playlist preload.
#[derive(Debug)]
pub struct PrefetchOutcome {
  pub url: Url,
  /// Stored image id, or why the image was skipped
  pub result: Result<String, FetchError>,
}

pub struct Prefetcher {
  network: Arc<dyn Network>,
  store: Arc<dyn ImageStore>,
  classifier: Arc<Classifier>,
  default_ttl: Option<chrono::Duration>,
}

impl Prefetcher {
  pub fn new(
    network: Arc<dyn Network>,
    store: Arc<dyn ImageStore>,
    classifier: Arc<Classifier>,
    default_ttl: Option<chrono::Duration>,
  ) -> Self {
    Self {
      network,
      store,
      classifier,
      default_ttl,
    }
  }

  /// Fetch one image and upsert it into the store. Returns the image id.
  ///
  /// `ttl` overrides the configured default expiry.
  pub async fn prefetch(
    &self,
    url: &Url,
    playlist_id: Option<&str>,
    ttl: Option<chrono::Duration>,
  ) -> Result<String, FetchError> {
    let id = self
      .classifier
      .extract_image_id(url.path())
      .ok_or_else(|| FetchError::NoImageId(url.to_string()))?;

    let response = self.network.fetch(&Request::get(url.clone())).await?;
    if !response.is_ok() {
      return Err(FetchError::Status(response.status));
    }

    let mime_type = response
      .header("content-type")
      .map(str::to_string)
      .unwrap_or_else(|| mime_for_path(url.path()).to_string());

    let mut image = CachedImage::new(id.clone(), response.body, mime_type);
    if let Some(playlist_id) = playlist_id {
      image = image.with_playlist(playlist_id);
    }
    if let Some(ttl) = ttl.or(self.default_ttl) {
      image = image.with_ttl(ttl);
    }

    self.store.put(&image)?;
    tracing::debug!(id = %id, url = %url, bytes = image.blob.len(), "image prefetched");
    Ok(id)
  }

  /// Preload a playlist's images a few at a time. One failure doesn't stop the rest.
  pub async fn prefetch_playlist(
    &self,
    playlist_id: &str,
    urls: &[Url],
    ttl: Option<chrono::Duration>,
  ) -> Vec<PrefetchOutcome> {
    let outcomes: Vec<PrefetchOutcome> = stream::iter(urls)
      .map(|url| async move {
        PrefetchOutcome {
          url: url.clone(),
          result: self.prefetch(url, Some(playlist_id), ttl).await,
        }
      })
      .buffered(CONCURRENCY)
      .collect()
      .await;

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    tracing::info!(
      playlist = playlist_id,
      total = outcomes.len(),
      failed,
      "playlist prefetched"
    );
    outcomes
  }
}
