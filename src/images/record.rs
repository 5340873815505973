use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

/// An image payload keyed by the identifier extracted from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
  pub id: String,
  pub blob: Bytes,
  pub mime_type: String,
  /// Secondary grouping key, set by whoever preloaded the image
  pub playlist_id: Option<String>,
  /// LRU signal, refreshed on every hit
  pub last_accessed_at: DateTime<Utc>,
  /// Absolute expiry. A record past this instant is treated as absent.
  pub expires_at: Option<DateTime<Utc>>,
}

impl CachedImage {
  pub fn new(id: impl Into<String>, blob: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      blob: blob.into(),
      mime_type: mime_type.into(),
      playlist_id: None,
      last_accessed_at: Utc::now(),
      expires_at: None,
    }
  }

  pub fn with_playlist(mut self, playlist_id: impl Into<String>) -> Self {
    self.playlist_id = Some(playlist_id.into());
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.expires_at = Some(Utc::now() + ttl);
    self
  }

  pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
    self.expires_at = Some(expires_at);
    self
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }
}

/// Record metadata returned by index scans (no payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
  pub id: String,
  pub mime_type: String,
  pub playlist_id: Option<String>,
  pub size: u64,
  pub last_accessed_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
}
