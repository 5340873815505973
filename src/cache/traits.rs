//! Core types describing how a request was answered.

use crate::http::Response;

/// A response together with the tier that produced it.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
}

impl Served {
  /// Fresh response from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  /// Response read from a namespace.
  pub fn from_cache(response: Response, revalidating: bool) -> Self {
    Self {
      response,
      source: if revalidating {
        CacheSource::CacheRevalidating
      } else {
        CacheSource::Cache
      },
    }
  }

  /// Cached response served because the network failed.
  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }

  pub fn with_source(response: Response, source: CacheSource) -> Self {
    Self { response, source }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Request was not eligible for caching and went straight to the network
  PassThrough,
  /// Match from a response namespace
  Cache,
  /// Match from a response namespace while a background refresh runs
  CacheRevalidating,
  /// Binary payload from the image store
  ImageStore,
  /// Network failed, serving a cached match
  Offline,
  /// Placeholder page for a navigation that could not be served
  OfflinePage,
}
