//! Durable, retryable queue for mutations attempted while disconnected.
//!
//! Every action moves through a small state machine:
//!
//! ```text
//! pending ──► processing ──► completed   (removed after a short delay)
//!                  │
//!                  ├──► pending          (retryable failure, after backoff)
//!                  └──► failed           (retries exhausted, needs a manual retry)
//! ```
//!
//! The whole queue is written to storage on every mutation and reloaded at
//! startup. Only one drain runs at a time; a second `process_queue` call
//! while one is in flight returns immediately.

mod action;
mod executor;
mod storage;

pub use action::{Action, ActionStatus, OfflineAction};
pub use executor::{ActionExecutor, HttpExecutor};
pub use storage::{QueueStorage, SqliteQueueStorage, QUEUE_KEY};

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{Backoff, QueueConfig};
use crate::connectivity::Connectivity;
use crate::error::ActionError;

/// How failed attempts are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub backoff: Backoff,
}

impl RetryPolicy {
  /// Delay before the given retry (1-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    match self.backoff {
      Backoff::Fixed => self.base_delay,
      Backoff::Exponential => {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
      }
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
  pub retry: RetryPolicy,
  /// How long a completed action stays visible before removal
  pub completed_ttl: Duration,
}

impl From<&QueueConfig> for QueueSettings {
  fn from(config: &QueueConfig) -> Self {
    Self {
      retry: RetryPolicy {
        max_retries: config.max_retries,
        base_delay: Duration::from_millis(config.retry_delay_ms),
        backoff: config.backoff,
      },
      completed_ttl: Duration::from_millis(config.completed_ttl_ms),
    }
  }
}

/// Notifications about queue activity.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
  Added { id: String },
  StatusChanged { id: String, status: ActionStatus },
  /// An attempt failed and another one is scheduled
  RetryScheduled { id: String, retries: u32, delay: Duration },
  /// Retries exhausted; the action now needs user attention
  Failed { id: String, error: String },
  Removed { id: String },
  /// The queue changed in memory but could not be written to storage
  PersistFailed { error: String },
}

/// Outcome of one `process_queue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// False when the call was a no-op (offline or another drain running)
  pub ran: bool,
  pub attempted: usize,
  pub completed: usize,
  pub retrying: usize,
  pub failed: usize,
}

type FailureCallback = Arc<dyn Fn(&OfflineAction) + Send + Sync>;

struct Inner {
  actions: Mutex<Vec<OfflineAction>>,
  storage: Arc<dyn QueueStorage>,
  executor: Arc<dyn ActionExecutor>,
  connectivity: Connectivity,
  settings: QueueSettings,
  processing: AtomicBool,
  events: broadcast::Sender<QueueEvent>,
  on_failure: Mutex<Option<FailureCallback>>,
}

/// Offline action queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct OfflineQueue {
  inner: Arc<Inner>,
}

/// Clears the processing flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl OfflineQueue {
  /// Load the persisted queue.
  ///
  /// Actions persisted mid-attempt are put back to `pending`, so a crash
  /// during delivery leads to a redelivery rather than a lost action.
  /// Completed actions left over from the previous run are dropped.
  pub fn new(
    storage: Arc<dyn QueueStorage>,
    executor: Arc<dyn ActionExecutor>,
    connectivity: Connectivity,
    settings: QueueSettings,
  ) -> Result<Self> {
    let mut actions = storage.load()?;
    actions.sort_by_key(|a| a.timestamp);

    let mut recovered = 0;
    for action in actions
      .iter_mut()
      .filter(|a| a.status == ActionStatus::Processing)
    {
      action.status = ActionStatus::Pending;
      recovered += 1;
    }
    // Their removal timers died with the previous process
    let before = actions.len();
    actions.retain(|a| a.status != ActionStatus::Completed);
    let expired = before - actions.len();

    if recovered > 0 || expired > 0 {
      tracing::info!(recovered, expired, "queue restored");
      storage.save(&actions)?;
    }

    let (events, _) = broadcast::channel(256);

    Ok(Self {
      inner: Arc::new(Inner {
        actions: Mutex::new(actions),
        storage,
        executor,
        connectivity,
        settings,
        processing: AtomicBool::new(false),
        events,
        on_failure: Mutex::new(None),
      }),
    })
  }

  /// Receive queue events from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  /// Called with the action whenever one reaches `failed`.
  pub fn set_failure_callback<F>(&self, callback: F)
  where
    F: Fn(&OfflineAction) + Send + Sync + 'static,
  {
    if let Ok(mut slot) = self.inner.on_failure.lock() {
      *slot = Some(Arc::new(callback));
    }
  }

  /// Queue an action and return its id.
  ///
  /// Never waits on the network: when online, a drain is started in the
  /// background; when offline the action just waits for reconnection.
  /// Fails, leaving the queue unchanged, when the action cannot be persisted.
  pub fn add_action(&self, action: Action) -> Result<String> {
    let record = OfflineAction::new(action, self.inner.settings.retry.max_retries);
    let id = record.id.clone();
    let kind = record.action.kind();

    {
      let mut actions = self.lock_actions();
      actions.push(record);
      if let Err(e) = self.inner.storage.save(&actions) {
        actions.pop();
        return Err(eyre!("Failed to persist action {}: {}", id, e));
      }
    }
    tracing::debug!(id = %id, kind, "action queued");
    self.emit(QueueEvent::Added { id: id.clone() });

    if self.inner.connectivity.is_online() {
      self.spawn_drain();
    }
    Ok(id)
  }

  /// Drain pending actions in creation order.
  ///
  /// No-op while offline or while another drain is running. Failures are
  /// recorded on the actions; nothing is propagated to the caller.
  pub async fn process_queue(&self) -> DrainReport {
    let mut report = DrainReport::default();

    if !self.inner.connectivity.is_online() {
      tracing::debug!("offline, queue drain skipped");
      return report;
    }
    if self
      .inner
      .processing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      tracing::debug!("queue drain already running");
      return report;
    }
    let guard = DrainGuard(&self.inner.processing);
    report.ran = true;

    while self.inner.connectivity.is_online() {
      let Some(action) = self.begin_next() else {
        break;
      };
      report.attempted += 1;

      match self.inner.executor.execute(&action).await {
        Ok(()) => {
          self.complete(&action.id);
          report.completed += 1;
        }
        Err(err) => {
          if self.record_failure(&action.id, &err) {
            report.retrying += 1;
          } else {
            report.failed += 1;
          }
        }
      }
    }

    if report.attempted > 0 {
      tracing::info!(
        attempted = report.attempted,
        completed = report.completed,
        retrying = report.retrying,
        failed = report.failed,
        "queue drained"
      );
    }

    drop(guard);
    // A retry may have become pending after the loop last looked
    if self.inner.connectivity.is_online() && self.pending_count() > 0 {
      self.spawn_drain();
    }
    report
  }

  /// Reset every failed action to `pending` with a fresh retry budget.
  ///
  /// Does not start a drain.
  pub fn retry_failed_actions(&self) -> usize {
    let reset: Vec<String> = self.mutate(|actions| {
      actions
        .iter_mut()
        .filter(|a| a.status == ActionStatus::Failed)
        .map(|a| {
          a.status = ActionStatus::Pending;
          a.retries = 0;
          a.last_error = None;
          a.id.clone()
        })
        .collect()
    });

    for id in &reset {
      self.emit(QueueEvent::StatusChanged {
        id: id.clone(),
        status: ActionStatus::Pending,
      });
    }
    reset.len()
  }

  pub fn clear_completed_actions(&self) -> usize {
    self.remove_where(|a| a.status == ActionStatus::Completed)
  }

  pub fn clear_all_actions(&self) -> usize {
    self.remove_where(|_| true)
  }

  /// Snapshot of the queue in creation order.
  pub fn actions(&self) -> Vec<OfflineAction> {
    self
      .inner
      .actions
      .lock()
      .map(|actions| actions.clone())
      .unwrap_or_default()
  }

  pub fn get(&self, id: &str) -> Option<OfflineAction> {
    self
      .inner
      .actions
      .lock()
      .ok()
      .and_then(|actions| actions.iter().find(|a| a.id == id).cloned())
  }

  pub fn pending_count(&self) -> usize {
    self.count_status(ActionStatus::Pending)
  }

  pub fn failed_count(&self) -> usize {
    self.count_status(ActionStatus::Failed)
  }

  pub fn is_processing(&self) -> bool {
    self.inner.processing.load(Ordering::SeqCst)
  }

  /// Start a drain on a background task.
  pub fn spawn_drain(&self) {
    let queue = self.clone();
    tokio::spawn(async move {
      queue.process_queue().await;
    });
  }

  fn count_status(&self, status: ActionStatus) -> usize {
    self
      .inner
      .actions
      .lock()
      .map(|actions| actions.iter().filter(|a| a.status == status).count())
      .unwrap_or(0)
  }

  /// Move the oldest pending action to `processing` and return a copy of it.
  fn begin_next(&self) -> Option<OfflineAction> {
    let next = self.mutate(|actions| {
      actions
        .iter_mut()
        .find(|a| a.status == ActionStatus::Pending)
        .map(|a| {
          a.status = ActionStatus::Processing;
          a.clone()
        })
    })?;

    tracing::debug!(id = %next.id, retries = next.retries, "action processing");
    self.emit(QueueEvent::StatusChanged {
      id: next.id.clone(),
      status: ActionStatus::Processing,
    });
    Some(next)
  }

  fn complete(&self, id: &str) {
    let found = self.mutate(|actions| match actions.iter_mut().find(|a| a.id == id) {
      Some(a) => {
        a.status = ActionStatus::Completed;
        a.last_error = None;
        true
      }
      None => false,
    });
    if !found {
      return;
    }

    tracing::debug!(id, "action completed");
    self.emit(QueueEvent::StatusChanged {
      id: id.to_string(),
      status: ActionStatus::Completed,
    });

    let queue = self.clone();
    let id = id.to_string();
    let ttl = self.inner.settings.completed_ttl;
    tokio::spawn(async move {
      tokio::time::sleep(ttl).await;
      queue.remove_where(|a| a.id == id && a.status == ActionStatus::Completed);
    });
  }

  /// Record a failed attempt. Returns true when another attempt is scheduled.
  ///
  /// Errors that no retry can fix fail the action straight away.
  fn record_failure(&self, id: &str, err: &ActionError) -> bool {
    let policy = self.inner.settings.retry;
    let error = err.to_string();
    let updated = self.mutate(|actions| {
      let a = actions.iter_mut().find(|a| a.id == id)?;
      a.last_error = Some(error.clone());
      if err.is_retryable() && a.retries < a.max_retries {
        a.retries += 1;
      } else {
        a.status = ActionStatus::Failed;
      }
      Some(a.clone())
    });
    let Some(action) = updated else {
      return false;
    };

    if action.status == ActionStatus::Failed {
      tracing::warn!(id, retries = action.retries, error = %error, "action failed permanently");
      self.emit(QueueEvent::StatusChanged {
        id: id.to_string(),
        status: ActionStatus::Failed,
      });
      self.emit(QueueEvent::Failed {
        id: id.to_string(),
        error,
      });
      let callback = self
        .inner
        .on_failure
        .lock()
        .ok()
        .and_then(|slot| slot.clone());
      if let Some(callback) = callback {
        callback(&action);
      }
      return false;
    }

    let delay = policy.delay_for(action.retries);
    tracing::debug!(id, retries = action.retries, ?delay, error = %error, "retry scheduled");
    self.emit(QueueEvent::RetryScheduled {
      id: id.to_string(),
      retries: action.retries,
      delay,
    });

    let queue = self.clone();
    let id = id.to_string();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let requeued = queue.mutate(|actions| {
        match actions
          .iter_mut()
          .find(|a| a.id == id && a.status == ActionStatus::Processing)
        {
          Some(a) => {
            a.status = ActionStatus::Pending;
            true
          }
          None => false,
        }
      });
      if requeued {
        queue.emit(QueueEvent::StatusChanged {
          id,
          status: ActionStatus::Pending,
        });
        queue.spawn_drain();
      }
    });
    true
  }

  fn remove_where<F>(&self, predicate: F) -> usize
  where
    F: Fn(&OfflineAction) -> bool,
  {
    let removed: Vec<String> = self.mutate(|actions| {
      let mut removed = Vec::new();
      actions.retain(|a| {
        if predicate(a) {
          removed.push(a.id.clone());
          false
        } else {
          true
        }
      });
      removed
    });

    for id in &removed {
      self.emit(QueueEvent::Removed { id: id.clone() });
    }
    removed.len()
  }

  fn lock_actions(&self) -> MutexGuard<'_, Vec<OfflineAction>> {
    match self.inner.actions.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Apply a change to the queue and persist the result.
  ///
  /// The in-memory change stands even when the write fails; subscribers
  /// get a `PersistFailed` event and the next successful write catches up.
  fn mutate<R>(&self, f: impl FnOnce(&mut Vec<OfflineAction>) -> R) -> R {
    let (result, saved) = {
      let mut actions = self.lock_actions();
      let result = f(&mut actions);
      (result, self.inner.storage.save(&actions))
    };
    if let Err(e) = saved {
      tracing::error!(error = %e, "failed to persist queue");
      self.emit(QueueEvent::PersistFailed {
        error: e.to_string(),
      });
    }
    result
  }

  fn emit(&self, event: QueueEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }
}
