//! Request classification for the fetch interceptor.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::collections::HashSet;

use crate::config::CacheConfig;
use crate::http::Request;

/// Content class of a request; decides which strategy answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Non-read method or non-network scheme, never cached
  PassThrough,
  Static,
  Image,
  Api,
  Other,
}

const STATIC_EXTENSIONS: [&str; 5] = ["css", "js", "woff2", "woff", "ttf"];

pub struct Classifier {
  static_paths: HashSet<String>,
  api_prefixes: Vec<String>,
  image_path: Regex,
  image_id: Regex,
}

impl Classifier {
  pub fn new(config: &CacheConfig) -> Result<Self> {
    let image_path = Regex::new(r"(?i)\.(?:jpe?g|png|gif|webp|avif|svg)$")
      .map_err(|e| eyre!("Failed to compile image path pattern: {}", e))?;
    let image_id = Regex::new(r"(?i)(\d+)\.(?:jpe?g|png|gif|webp|avif)$")
      .map_err(|e| eyre!("Failed to compile image id pattern: {}", e))?;

    Ok(Self {
      static_paths: config.static_paths.iter().cloned().collect(),
      api_prefixes: config.api_prefixes.clone(),
      image_path,
      image_id,
    })
  }

  /// First match wins: static, image, api, everything else.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if !request.method.is_read() || !matches!(request.url.scheme(), "http" | "https") {
      return RequestClass::PassThrough;
    }

    let path = request.url.path();
    if self.is_static(path) {
      RequestClass::Static
    } else if path.contains("/images/") || self.image_path.is_match(path) {
      RequestClass::Image
    } else if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      RequestClass::Api
    } else {
      RequestClass::Other
    }
  }

  fn is_static(&self, path: &str) -> bool {
    if self.static_paths.contains(path) {
      return true;
    }
    let file = path.rsplit('/').next().unwrap_or(path);
    file
      .rsplit_once('.')
      .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
  }

  /// Trailing numeric id before an image extension, e.g. `/images/42.jpg` -> `42`.
  pub fn extract_image_id(&self, path: &str) -> Option<String> {
    self
      .image_id
      .captures(path)
      .and_then(|c| c.get(1))
      .map(|m| m.as_str().to_string())
  }
}
