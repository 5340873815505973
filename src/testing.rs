//! Test doubles for the network and the action executor.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ActionError, FetchError};
use crate::http::{Network, Request, Response};
use crate::queue::{ActionExecutor, OfflineAction};

/// Scripted network: answers from a URL table, 404 for anything else.
#[derive(Default)]
pub struct MockNetwork {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Every fetch fails with a network error while offline.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("connection refused".to_string()));
    }
    let response = self
      .responses
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}

/// Executor that records which actions ran, optionally failing or stalling.
#[derive(Default)]
pub struct MockExecutor {
  executed: Mutex<Vec<String>>,
  error: Mutex<Option<ActionError>>,
  delay: Mutex<Option<Duration>>,
}

impl MockExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn failing() -> Self {
    let executor = Self::default();
    executor.set_failing(true);
    executor
  }

  /// Toggle failing every attempt with a retryable 503.
  pub fn set_failing(&self, fail: bool) {
    *self.error.lock().unwrap() = fail.then_some(ActionError::Rejected { status: 503 });
  }

  pub fn fail_with(&self, error: ActionError) {
    *self.error.lock().unwrap() = Some(error);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Ids of executed actions, in execution order (failed attempts included).
  pub fn executed(&self) -> Vec<String> {
    self.executed.lock().unwrap().clone()
  }

  pub fn calls(&self) -> usize {
    self.executed.lock().unwrap().len()
  }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
  async fn execute(&self, action: &OfflineAction) -> Result<(), ActionError> {
    self.executed.lock().unwrap().push(action.id.clone());
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    match self.error.lock().unwrap().clone() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}
