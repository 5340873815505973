//! Tiered image strategy: image store, then the images namespace, then the network.

use std::sync::Arc;

use crate::cache::{CacheLayer, CacheSource, Served};
use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::images::{CachedImage, ImageStore};

/// Marker header identifying responses built from the image store.
pub const SERVED_FROM_HEADER: &str = "x-served-from";
const IMMUTABLE: &str = "public, max-age=31536000, immutable";

pub struct ImageStrategy {
  layer: CacheLayer,
  store: Arc<dyn ImageStore>,
  namespace: String,
}

impl ImageStrategy {
  pub fn new(layer: CacheLayer, store: Arc<dyn ImageStore>, namespace: impl Into<String>) -> Self {
    Self {
      layer,
      store,
      namespace: namespace.into(),
    }
  }

  /// Resolve an image request. `image_id` is the identifier extracted from
  /// the path, if any.
  ///
  /// The image store is only read here; populating it is the prefetcher's job.
  pub async fn serve(&self, request: &Request, image_id: Option<&str>) -> Result<Served, FetchError> {
    if let Some(id) = image_id {
      if let Some(image) = self.lookup(id) {
        return Ok(Served::with_source(image_response(&image), CacheSource::ImageStore));
      }
    }

    match self.layer.cache_first(&self.namespace, request).await {
      Ok(served) => Ok(served),
      Err(err) => {
        let key = request.cache_key();
        tracing::debug!(request = %key, error = %err, "image fetch failed, retrying namespace");
        match self.layer.storage().match_request(&self.namespace, &key) {
          Ok(Some(cached)) => Ok(Served::offline(cached)),
          _ => Err(err),
        }
      }
    }
  }

  fn lookup(&self, id: &str) -> Option<CachedImage> {
    match self.store.get(id) {
      Ok(image) => image,
      Err(e) => {
        tracing::warn!(id, error = %e, "image store read failed, treating as miss");
        None
      }
    }
  }
}

fn image_response(image: &CachedImage) -> Response {
  Response::new(200, image.blob.clone())
    .with_header("content-type", image.mime_type.clone())
    .with_header("content-length", image.blob.len().to_string())
    .with_header("cache-control", IMMUTABLE)
    .with_header(SERVED_FROM_HEADER, "image-store")
}
