//! Deferred mutations queued while offline and replayed later.
//!
//! The queue is a persisted FIFO with a fixed capacity. A drain replays every
//! item once, in order, removing only the ones whose replay succeeded. There
//! is no backoff between drains; failed items wait for the next one.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::net::{Network, Request};

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSyncItem {
  /// Monotonic; defines replay order
  pub id: i64,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
}

/// Trait for sync queue storage backends.
pub trait QueueStore: Send + Sync {
  /// Append an item at the tail.
  fn push_item(&self, payload: &Value) -> Result<PendingSyncItem>;

  /// All items, oldest first.
  fn items(&self) -> Result<Vec<PendingSyncItem>>;

  fn remove_item(&self, id: i64) -> Result<bool>;

  /// Increment the attempt counter of an item.
  fn record_attempt(&self, id: i64) -> Result<()>;

  /// Drop the oldest items until at most `keep` remain. Returns the number dropped.
  fn evict_oldest(&self, keep: usize) -> Result<usize>;
}

/// What woke the queue up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
  /// The host came back online
  ConnectivityRestored,
  /// A background sync event carrying a tag
  Tag(String),
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
}

pub struct SyncQueue {
  store: Arc<dyn QueueStore>,
  network: Arc<dyn Network>,
  endpoint: Url,
  capacity: usize,
  tag: String,
  /// Serializes enqueue and drain so FIFO order holds
  owner: tokio::sync::Mutex<()>,
}

impl SyncQueue {
  pub fn new(config: &Config, store: Arc<dyn QueueStore>, network: Arc<dyn Network>) -> Result<Self> {
    Ok(Self {
      store,
      network,
      endpoint: config.resolve(&config.sync.endpoint)?,
      capacity: config.sync.capacity,
      tag: config.sync.tag.clone(),
      owner: tokio::sync::Mutex::new(()),
    })
  }

  /// Queue a mutation, dropping the oldest items beyond capacity.
  pub async fn enqueue(&self, payload: Value) -> Result<PendingSyncItem> {
    let _owner = self.owner.lock().await;
    let item = self.store.push_item(&payload)?;

    let evicted = self.store.evict_oldest(self.capacity)?;
    if evicted > 0 {
      warn!(evicted, capacity = self.capacity, "sync queue full, dropped oldest items");
    }

    debug!(id = item.id, "queued deferred mutation");
    Ok(item)
  }

  pub fn pending(&self) -> Result<Vec<PendingSyncItem>> {
    self.store.items()
  }

  /// Whether this queue reacts to `trigger`.
  pub fn accepts(&self, trigger: &SyncTrigger) -> bool {
    match trigger {
      SyncTrigger::ConnectivityRestored => true,
      SyncTrigger::Tag(tag) => *tag == self.tag,
    }
  }

  /// Drain if the trigger is ours; other tags are ignored.
  pub async fn handle_trigger(&self, trigger: &SyncTrigger) -> Result<Option<DrainReport>> {
    if !self.accepts(trigger) {
      debug!(?trigger, "ignoring sync trigger");
      return Ok(None);
    }
    self.drain().await.map(Some)
  }

  /// Replay every queued item once, in FIFO order.
  ///
  /// Non-2xx responses and transport errors count as failures: the item stays
  /// queued with its attempt counter bumped. Draining an empty queue is a no-op.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _owner = self.owner.lock().await;
    let items = self.store.items()?;
    let mut report = DrainReport::default();

    for item in &items {
      let outcome = match Request::post_json(self.endpoint.clone(), &item.payload) {
        Ok(request) => self.network.fetch(&request).await,
        Err(e) => Err(e),
      };

      match outcome {
        Ok(response) if response.is_success() => {
          if let Err(e) = self.store.remove_item(item.id) {
            warn!(id = item.id, "failed to remove replayed item: {}", e);
          }
          report.replayed += 1;
        }
        Ok(response) => {
          warn!(id = item.id, status = response.status, "replay rejected");
          self.note_failure(item);
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = item.id, "replay failed: {}", e);
          self.note_failure(item);
          report.failed += 1;
        }
      }
    }

    report.remaining = items.len() - report.replayed;
    if !items.is_empty() {
      info!(
        replayed = report.replayed,
        failed = report.failed,
        "sync drain finished"
      );
    }
    Ok(report)
  }

  fn note_failure(&self, item: &PendingSyncItem) {
    if let Err(e) = self.store.record_attempt(item.id) {
      warn!(id = item.id, "failed to record replay attempt: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::net::mock::MockNetwork;
  use crate::net::Response;
  use serde_json::json;

  const ENDPOINT: &str = "https://app.test/api/sync";

  fn queue(capacity: usize) -> (SyncQueue, Arc<MockNetwork>) {
    let mut config = Config {
      origin: "https://app.test".to_string(),
      ..Config::default()
    };
    config.sync.capacity = capacity;
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = MockNetwork::new();
    let queue = SyncQueue::new(&config, store, network.clone()).unwrap();
    (queue, network)
  }

  fn ns(items: &[PendingSyncItem]) -> Vec<i64> {
    items.iter().map(|i| i.payload["n"].as_i64().unwrap()).collect()
  }

  #[tokio::test]
  async fn test_enqueue_over_capacity_drops_oldest() {
    let (queue, _) = queue(50);
    for n in 0..53 {
      queue.enqueue(json!({ "n": n })).await.unwrap();
    }

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 50);
    assert_eq!(ns(&pending)[0], 3);
    assert_eq!(ns(&pending)[49], 52);
  }

  #[tokio::test]
  async fn test_drain_removes_only_successful_replays_in_order() {
    let (queue, network) = queue(50);
    network.respond_with(ENDPOINT, |req| {
      let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
      match body["n"].as_i64() {
        Some(1) => Ok(Response::new(500, "nope")),
        Some(3) => Err("reset".to_string()),
        _ => Ok(Response::new(201, "")),
      }
    });
    for n in 0..5 {
      queue.enqueue(json!({ "n": n })).await.unwrap();
    }

    let report = queue.drain().await.unwrap();
    assert_eq!(
      report,
      DrainReport {
        replayed: 3,
        failed: 2,
        remaining: 2
      }
    );

    let pending = queue.pending().unwrap();
    assert_eq!(ns(&pending), vec![1, 3]);
    assert!(pending.iter().all(|i| i.attempts == 1));

    let replay_order: Vec<i64> = network
      .requests()
      .iter()
      .map(|r| serde_json::from_slice::<Value>(r.body.as_deref().unwrap()).unwrap()["n"].as_i64().unwrap())
      .collect();
    assert_eq!(replay_order, vec![0, 1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn test_failed_items_retry_on_next_drain() {
    let (queue, network) = queue(50);
    network.fail(ENDPOINT);
    queue.enqueue(json!({ "n": 7 })).await.unwrap();

    queue.drain().await.unwrap();
    queue.drain().await.unwrap();
    assert_eq!(queue.pending().unwrap()[0].attempts, 2);

    network.respond(ENDPOINT, Response::new(200, "ok"));
    let report = queue.drain().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_drain_empty_queue_is_noop() {
    let (queue, network) = queue(50);
    assert_eq!(queue.drain().await.unwrap(), DrainReport::default());
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_replay_posts_json_payload() {
    let (queue, network) = queue(50);
    network.respond(ENDPOINT, Response::new(200, "ok"));
    queue
      .enqueue(json!({ "action": "checkin", "code": "ABC" }))
      .await
      .unwrap();
    queue.drain().await.unwrap();

    let requests = network.requests();
    assert_eq!(requests[0].method, reqwest::Method::POST);
    assert_eq!(
      requests[0].headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
    let body: Value = serde_json::from_slice(requests[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({ "action": "checkin", "code": "ABC" }));
  }

  #[tokio::test]
  async fn test_only_own_tag_triggers_drain() {
    let (queue, network) = queue(50);
    network.respond(ENDPOINT, Response::new(200, "ok"));
    queue.enqueue(json!({ "n": 1 })).await.unwrap();

    let other = SyncTrigger::Tag("someone-else".to_string());
    assert_eq!(queue.handle_trigger(&other).await.unwrap(), None);
    assert_eq!(queue.pending().unwrap().len(), 1);

    let ours = SyncTrigger::Tag("sync-pending".to_string());
    let report = queue.handle_trigger(&ours).await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);

    assert!(queue.accepts(&SyncTrigger::ConnectivityRestored));
  }
}
