//! Error types for the read path (fetch) and the write path (queued actions).

use thiserror::Error;

/// Failure while resolving a content request.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  /// Transport-level failure: connection refused, DNS, abort, timeout
  #[error("network request failed: {0}")]
  Network(String),

  /// A backing store could not be read or written
  #[error("storage error: {0}")]
  Storage(String),

  #[error("unsupported scheme '{0}'")]
  UnsupportedScheme(String),

  /// The server answered with a status that can't be cached
  #[error("unexpected status {0}")]
  Status(u16),

  #[error("no image id in '{0}'")]
  NoImageId(String),
}

impl From<color_eyre::Report> for FetchError {
  fn from(report: color_eyre::Report) -> Self {
    FetchError::Storage(report.to_string())
  }
}

/// Failure while executing a queued mutation against the backend.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
  #[error("network request failed: {0}")]
  Network(String),

  /// The backend answered, but not with a 2xx status
  #[error("request rejected with status {status}")]
  Rejected { status: u16 },

  #[error("i/o error: {0}")]
  Io(String),

  /// The action can never be turned into a valid request
  #[error("invalid action: {0}")]
  InvalidAction(String),
}

impl ActionError {
  /// Whether another attempt could succeed.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, ActionError::InvalidAction(_))
  }
}

impl From<reqwest::Error> for ActionError {
  fn from(e: reqwest::Error) -> Self {
    ActionError::Network(e.to_string())
  }
}

impl From<std::io::Error> for ActionError {
  fn from(e: std::io::Error) -> Self {
    ActionError::Io(e.to_string())
  }
}
