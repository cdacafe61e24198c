//! Command channel between the foreground application and the controller.
//!
//! Messages arrive on a port and are handled one at a time. A message that
//! expects an answer carries a one-shot reply sender, so at most one reply can
//! ever be sent for it. Unknown message types are dropped without a reply.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
  SkipWaiting,
  GetVersion,
  ClearCache,
  ForceUpdate,
  /// Anything this version does not understand
  #[serde(other)]
  Unknown,
}

impl ControlType {
  pub fn parse(name: &str) -> Self {
    serde_json::from_value(Value::String(name.to_string())).unwrap_or(ControlType::Unknown)
  }
}

#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: ControlType,
  #[serde(default)]
  payload: Value,
}

#[derive(Debug)]
pub struct ControlMessage {
  pub kind: ControlType,
  pub payload: Value,
  pub reply: Option<oneshot::Sender<Value>>,
}

impl ControlMessage {
  pub fn new(kind: ControlType) -> Self {
    Self {
      kind,
      payload: Value::Null,
      reply: None,
    }
  }

  /// Parse a `{type, payload}` envelope.
  pub fn from_json(raw: &str) -> Result<Self> {
    let envelope: Envelope =
      serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse control message: {}", e))?;
    Ok(Self {
      kind: envelope.kind,
      payload: envelope.payload,
      reply: None,
    })
  }

  /// Attach a reply port; the receiver resolves when the controller answers.
  pub fn with_reply(mut self) -> (Self, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    self.reply = Some(tx);
    (self, rx)
  }
}

/// Handle one message against the lifecycle manager.
pub async fn dispatch(lifecycle: &LifecycleManager, message: ControlMessage) {
  let ControlMessage {
    kind,
    payload,
    reply,
  } = message;
  debug!(?kind, %payload, "control message");

  let answer = match kind {
    ControlType::SkipWaiting => {
      match lifecycle.skip_waiting().await {
        Ok(true) => info!("skip waiting: activated waiting version"),
        Ok(false) => debug!("skip waiting: nothing waiting"),
        Err(e) => warn!("skip waiting failed: {}", e),
      }
      None
    }
    ControlType::GetVersion => Some(json!({
      "version": lifecycle
        .active_version()
        .unwrap_or_else(|| lifecycle.version().to_string()),
      "timestamp": Utc::now().timestamp_millis(),
    })),
    ControlType::ClearCache => Some(outcome(lifecycle.clear_all().await.map(|_| ()))),
    ControlType::ForceUpdate => Some(outcome(lifecycle.force_update().await.map(|_| ()))),
    ControlType::Unknown => None,
  };

  if let (Some(answer), Some(reply)) = (answer, reply) {
    // the sender may have stopped listening; nothing to do then
    let _ = reply.send(answer);
  }
}

fn outcome(result: Result<()>) -> Value {
  match result {
    Ok(()) => json!({ "success": true }),
    Err(e) => {
      warn!("control command failed: {}", e);
      json!({ "success": false, "error": e.to_string() })
    }
  }
}

/// Sending side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlPort {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlPort {
  /// Start the channel task serving messages for `lifecycle`.
  pub fn spawn(lifecycle: Arc<LifecycleManager>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        dispatch(&lifecycle, message).await;
      }
    });

    Self { tx }
  }

  /// Fire-and-forget.
  pub fn post(&self, message: ControlMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .map_err(|_| eyre!("Control channel closed"))
  }

  /// Send and wait for the reply. `None` when the message gets no reply.
  pub async fn request(&self, message: ControlMessage) -> Result<Option<Value>> {
    let (message, rx) = message.with_reply();
    self.post(message)?;
    Ok(rx.await.ok())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, SqliteStore};
  use crate::config::Config;
  use crate::lifecycle::Phase;
  use crate::net::mock::MockNetwork;
  use crate::net::Response;

  fn config(version: &str, skip_waiting: bool) -> Config {
    let mut config = Config {
      version: version.to_string(),
      origin: "https://app.test".to_string(),
      static_manifest: vec!["/".to_string()],
      ..Config::default()
    };
    config.install.skip_waiting = skip_waiting;
    config
  }

  async fn installed(
    version: &str,
  ) -> (Arc<LifecycleManager>, Arc<SqliteStore>, Arc<MockNetwork>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = MockNetwork::new();
    network.respond("https://app.test/", Response::new(200, "<html>"));
    let lifecycle =
      Arc::new(LifecycleManager::new(&config(version, true), store.clone(), network.clone()).unwrap());
    lifecycle.install().await.unwrap();
    (lifecycle, store, network)
  }

  #[test]
  fn test_parse_known_and_unknown_types() {
    assert_eq!(ControlType::parse("GET_VERSION"), ControlType::GetVersion);
    assert_eq!(ControlType::parse("FORCE_UPDATE"), ControlType::ForceUpdate);
    assert_eq!(ControlType::parse("PREFETCH_ROUTES"), ControlType::Unknown);

    let msg = ControlMessage::from_json(r#"{"type":"SOMETHING_NEW","payload":{"a":1}}"#).unwrap();
    assert_eq!(msg.kind, ControlType::Unknown);
    assert_eq!(msg.payload["a"], 1);
    assert!(ControlMessage::from_json("not json").is_err());
  }

  #[tokio::test]
  async fn test_get_version_reply() {
    let (lifecycle, _, _) = installed("v4").await;
    let port = ControlPort::spawn(lifecycle);

    let reply = port
      .request(ControlMessage::new(ControlType::GetVersion))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply["version"], "v4");
    assert!(reply["timestamp"].as_i64().unwrap() > 0);
  }

  #[tokio::test]
  async fn test_envelope_with_payload_is_served() {
    let (lifecycle, _, _) = installed("v2").await;
    let port = ControlPort::spawn(lifecycle);

    let message =
      ControlMessage::from_json(r#"{"type":"GET_VERSION","payload":{"client":"tab-1"}}"#).unwrap();
    assert_eq!(message.payload, json!({ "client": "tab-1" }));
    let reply = port.request(message).await.unwrap().unwrap();
    assert_eq!(reply["version"], "v2");
  }

  #[tokio::test]
  async fn test_unknown_type_no_reply_no_change() {
    let (lifecycle, store, network) = installed("v1").await;
    let before = store.namespaces().unwrap();
    let calls = network.calls().len();
    let port = ControlPort::spawn(lifecycle.clone());

    let reply = port
      .request(ControlMessage::from_json(r#"{"type":"PURGE_EVERYTHING"}"#).unwrap())
      .await
      .unwrap();
    assert_eq!(reply, None);
    assert_eq!(store.namespaces().unwrap(), before);
    assert_eq!(network.calls().len(), calls);
    assert_eq!(lifecycle.active_version().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_clear_cache_deletes_owned_namespaces() {
    let (lifecycle, store, _) = installed("v1").await;
    store.open_namespace("edgesync-dynamic-v1").unwrap();
    store.open_namespace("unrelated").unwrap();

    let port = ControlPort::spawn(lifecycle);
    let reply = port
      .request(ControlMessage::new(ControlType::ClearCache))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply, json!({ "success": true }));
    assert_eq!(store.namespaces().unwrap(), vec!["unrelated".to_string()]);
  }

  #[tokio::test]
  async fn test_force_update_repopulates_static() {
    let (lifecycle, store, network) = installed("v1").await;
    network.respond("https://app.test/", Response::new(200, "<html>v1.1</html>"));

    let port = ControlPort::spawn(lifecycle);
    let reply = port
      .request(ControlMessage::new(ControlType::ForceUpdate))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply["success"], true);

    let entry = store
      .get("edgesync-static-v1", "GET https://app.test/")
      .unwrap()
      .unwrap();
    assert_eq!(entry.body, b"<html>v1.1</html>");
  }

  #[tokio::test]
  async fn test_force_update_failure_reports_error() {
    let (lifecycle, _, network) = installed("v1").await;
    network.fail("https://app.test/");

    let port = ControlPort::spawn(lifecycle);
    let reply = port
      .request(ControlMessage::new(ControlType::ForceUpdate))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply["success"], false);
    assert!(reply["error"].is_string());
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_without_reply() {
    let (_, store, network) = installed("v1").await;
    let v2 = Arc::new(LifecycleManager::new(&config("v2", false), store, network).unwrap());
    assert_eq!(v2.install().await.unwrap(), Phase::Waiting);

    let port = ControlPort::spawn(v2.clone());
    let reply = port
      .request(ControlMessage::new(ControlType::SkipWaiting))
      .await
      .unwrap();
    assert_eq!(reply, None);
    assert_eq!(v2.active_version().as_deref(), Some("v2"));
  }
}
