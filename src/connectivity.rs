//! Online/offline tracking.
//!
//! The monitor owns the current state; cheap `Connectivity` handles read it.
//! Transitions to online can trigger a queue drain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::http::{Method, Network, Request, RequestMode};
use crate::queue::OfflineQueue;

/// Read-only view of the connectivity state.
#[derive(Clone)]
pub struct Connectivity {
  rx: watch::Receiver<bool>,
}

impl Connectivity {
  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }
}

/// Tracks online/offline transitions.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  pub fn handle(&self) -> Connectivity {
    Connectivity {
      rx: self.tx.subscribe(),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Feed a platform signal. Repeating the current state is not a transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|state| {
      if *state == online {
        false
      } else {
        *state = online;
        true
      }
    });
    if changed {
      tracing::info!(online, "connectivity changed");
    }
  }

  /// Drain the queue on every transition to online.
  pub fn spawn_reconnect_drain(&self, queue: OfflineQueue) -> JoinHandle<()> {
    let mut rx = self.tx.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online {
          queue.process_queue().await;
        }
      }
    })
  }

  /// Poll `url` with HEAD requests and report reachability.
  ///
  /// Any HTTP answer counts as online; a transport failure as offline.
  pub fn spawn_probe(&self, network: Arc<dyn Network>, url: Url, every: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let request = Request {
        method: Method::Head,
        url,
        mode: RequestMode::Subresource,
      };
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let reachable = network.fetch(&request).await.is_ok();
        monitor.set_online(reachable);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{Action, QueueSettings, RetryPolicy, SqliteQueueStorage};
  use crate::testing::{MockExecutor, MockNetwork};

  #[test]
  fn test_handles_follow_monitor() {
    let monitor = ConnectivityMonitor::new(true);
    let handle = monitor.handle();
    assert!(handle.is_online());

    monitor.set_online(false);
    assert!(!handle.is_online());
    assert!(!monitor.is_online());
  }

  #[tokio::test]
  async fn test_offline_add_then_online_drain() {
    let executor = Arc::new(MockExecutor::new());
    let monitor = ConnectivityMonitor::new(false);
    let queue = OfflineQueue::new(
      Arc::new(SqliteQueueStorage::in_memory().unwrap()),
      executor.clone(),
      monitor.handle(),
      QueueSettings {
        retry: RetryPolicy {
          max_retries: 3,
          base_delay: Duration::from_millis(5),
          backoff: crate::config::Backoff::Fixed,
        },
        completed_ttl: Duration::from_secs(60),
      },
    )
    .unwrap();
    monitor.spawn_reconnect_drain(queue.clone());

    let ids: Vec<String> = ["1", "2", "3"]
      .iter()
      .map(|id| {
        queue
          .add_action(Action::DeleteImage {
            image_id: id.to_string(),
          })
          .unwrap()
      })
      .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(executor.calls(), 0);

    monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.executed(), ids);

    // Going offline and back does not replay completed work
    monitor.set_online(false);
    monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(executor.calls(), 3);
  }

  #[tokio::test]
  async fn test_probe_reports_unreachable_origin() {
    let network = Arc::new(MockNetwork::new());
    network.set_offline(true);
    let monitor = ConnectivityMonitor::new(true);

    let probe = monitor.spawn_probe(
      network.clone(),
      Url::parse("https://app.test/").unwrap(),
      Duration::from_millis(5),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!monitor.is_online());

    network.set_offline(false);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(monitor.is_online());
    probe.abort();
  }
}
