//! Request/response model and the network seam used by every fetch strategy.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Read methods are the only ones the cache ever answers.
  pub fn is_read(self) -> bool {
    matches!(self, Method::Get | Method::Head)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// Whether a request is a top-level page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  Navigate,
  #[default]
  Subresource,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Stable cache identity: method plus full URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.as_str(), url)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Lowercased header names
  pub headers: BTreeMap<String, String>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx status. Only these responses are written into a cache.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Anything able to perform a network fetch.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    match request.url.scheme() {
      "http" | "https" => {}
      other => return Err(FetchError::UnsupportedScheme(other.to_string())),
    }

    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Content type guessed from a file extension.
pub fn mime_for_path(name: &str) -> &'static str {
  let ext = name
    .rsplit_once('.')
    .map(|(_, ext)| ext.to_ascii_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "gif" => "image/gif",
    "webp" => "image/webp",
    "avif" => "image/avif",
    "svg" => "image/svg+xml",
    _ => "application/octet-stream",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::get(Url::parse("https://x.test/api/playlists?page=2#top").unwrap());
    let b = Request::get(Url::parse("https://x.test/api/playlists?page=2").unwrap());
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key(), "GET https://x.test/api/playlists?page=2");
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/plain"));
  }

  #[test]
  fn test_only_2xx_is_ok() {
    assert!(Response::new(204, "").is_ok());
    assert!(!Response::new(304, "").is_ok());
    assert!(!Response::new(500, "").is_ok());
  }

  #[test]
  fn test_mime_for_path() {
    assert_eq!(mime_for_path("beach.JPG"), "image/jpeg");
    assert_eq!(mime_for_path("photo.webp"), "image/webp");
    assert_eq!(mime_for_path("README"), "application/octet-stream");
  }
}
