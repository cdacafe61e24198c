//! The single authority: one controller per process, with its store and
//! network injected, governing every intercepted request.

use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheStore, Resolution, SqliteStore};
use crate::classify::Classifier;
use crate::config::Config;
use crate::control::ControlPort;
use crate::lifecycle::{LifecycleManager, Phase};
use crate::net::{Network, Request};
use crate::notify::{ClickOutcome, Notification, NotificationDispatcher, PushPayload};
use crate::strategy::StrategyEngine;
use crate::sync::{DrainReport, PendingSyncItem, QueueStore, SyncQueue, SyncTrigger};

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
  pub name: String,
  pub entries: usize,
}

/// Snapshot of controller state for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub version: String,
  pub phase: Option<String>,
  pub active: Option<String>,
  pub waiting: Option<String>,
  pub clients: usize,
  pub namespaces: Vec<NamespaceStatus>,
  pub pending_sync: usize,
}

pub struct Controller {
  classifier: Classifier,
  strategies: StrategyEngine,
  lifecycle: Arc<LifecycleManager>,
  sync: SyncQueue,
  notifications: NotificationDispatcher,
  cache: Arc<dyn CacheStore>,
}

impl Controller {
  pub fn new(
    config: &Config,
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn QueueStore>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let lifecycle = Arc::new(LifecycleManager::new(config, cache.clone(), network.clone())?);
    Ok(Self {
      classifier: Classifier::from_config(config),
      strategies: StrategyEngine::new(config, cache.clone(), network.clone(), lifecycle.clone())?,
      lifecycle,
      sync: SyncQueue::new(config, queue, network)?,
      notifications: NotificationDispatcher::new(config.notifications.clone()),
      cache,
    })
  }

  /// Controller over a single SQLite store holding both cache and queue.
  pub fn with_sqlite(config: &Config, store: Arc<SqliteStore>, network: Arc<dyn Network>) -> Result<Self> {
    Self::new(config, store.clone(), store, network)
  }

  pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
    &self.lifecycle
  }

  pub async fn install(&self) -> Result<Phase> {
    self.lifecycle.install().await
  }

  /// Resolve an intercepted request.
  ///
  /// `None` means the request is left to default network handling: its scheme
  /// is not HTTP(S), or no version is active to control it.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Resolution> {
    let class = self.classifier.classify(request)?;
    if let Some(client_id) = &request.client_id {
      self.lifecycle.connect_client(client_id);
    }
    let namespaces = self.lifecycle.active_namespaces()?;
    debug!(url = %request.url, %class, "intercepted");
    Some(self.strategies.resolve(class, request, &namespaces).await)
  }

  /// A port for the foreground application, served by its own task.
  pub fn control_port(&self) -> ControlPort {
    ControlPort::spawn(self.lifecycle.clone())
  }

  pub async fn enqueue(&self, payload: Value) -> Result<PendingSyncItem> {
    self.sync.enqueue(payload).await
  }

  pub async fn handle_sync(&self, trigger: &SyncTrigger) -> Result<Option<DrainReport>> {
    self.sync.handle_trigger(trigger).await
  }

  pub fn handle_push(&self, payload: &PushPayload) -> Notification {
    self.notifications.on_push(payload)
  }

  pub fn handle_click(&self, action: Option<&str>) -> ClickOutcome {
    self.notifications.on_click(action)
  }

  pub fn status(&self) -> Result<Status> {
    let namespaces = self
      .cache
      .namespaces()?
      .into_iter()
      .map(|name| -> Result<NamespaceStatus> {
        let entries = self.cache.entry_count(&name)?;
        Ok(NamespaceStatus { name, entries })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Status {
      version: self.lifecycle.version().to_string(),
      phase: self.lifecycle.phase().map(|p| p.to_string()),
      active: self.lifecycle.active_version(),
      waiting: self.lifecycle.waiting_version(),
      clients: self.lifecycle.clients().len(),
      namespaces,
      pending_sync: self.sync.pending()?.len(),
    })
  }
}
