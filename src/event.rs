use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::cache::Resolution;
use crate::controller::Controller;
use crate::net::Request;
use crate::notify::{ClickOutcome, Notification, PushPayload};
use crate::sync::{DrainReport, SyncTrigger};

/// Host events delivered to the controller
#[derive(Debug)]
pub enum Event {
  /// Intercepted request; `None` in reply means default network handling
  Fetch {
    request: Request,
    respond: oneshot::Sender<Option<Resolution>>,
  },
  /// Connectivity restored or background sync fired
  Sync {
    trigger: SyncTrigger,
    respond: oneshot::Sender<Option<DrainReport>>,
  },
  Push {
    payload: PushPayload,
    respond: oneshot::Sender<Notification>,
  },
  NotificationClick {
    action: Option<String>,
    respond: oneshot::Sender<ClickOutcome>,
  },
}

/// Event handler that feeds host events to the controller.
///
/// Every fetch and sync event runs as its own task, so a slow request never
/// holds up another. A caller that stops waiting does not cancel the task;
/// cache writes it started still land.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventHandler {
  pub fn new(controller: Arc<Controller>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let controller = controller.clone();
        match event {
          Event::Fetch { request, respond } => {
            tokio::spawn(async move {
              let resolution = controller.handle_fetch(&request).await;
              let _ = respond.send(resolution);
            });
          }
          Event::Sync { trigger, respond } => {
            tokio::spawn(async move {
              let report = match controller.handle_sync(&trigger).await {
                Ok(report) => report,
                Err(e) => {
                  warn!(?trigger, "sync failed: {}", e);
                  None
                }
              };
              let _ = respond.send(report);
            });
          }
          Event::Push { payload, respond } => {
            let _ = respond.send(controller.handle_push(&payload));
          }
          Event::NotificationClick { action, respond } => {
            let _ = respond.send(controller.handle_click(action.as_deref()));
          }
        }
      }
    });

    Self { tx }
  }

  fn send(&self, event: Event) -> Result<()> {
    self.tx.send(event).map_err(|_| eyre!("Event loop stopped"))
  }

  pub async fn fetch(&self, request: Request) -> Result<Option<Resolution>> {
    let (respond, rx) = oneshot::channel();
    self.send(Event::Fetch { request, respond })?;
    rx.await.map_err(|_| eyre!("Fetch task dropped without a response"))
  }

  pub async fn sync(&self, trigger: SyncTrigger) -> Result<Option<DrainReport>> {
    let (respond, rx) = oneshot::channel();
    self.send(Event::Sync { trigger, respond })?;
    rx.await.map_err(|_| eyre!("Sync task dropped without a report"))
  }

  pub async fn push(&self, payload: PushPayload) -> Result<Notification> {
    let (respond, rx) = oneshot::channel();
    self.send(Event::Push { payload, respond })?;
    rx.await.map_err(|_| eyre!("Push event dropped"))
  }

  pub async fn click(&self, action: Option<String>) -> Result<ClickOutcome> {
    let (respond, rx) = oneshot::channel();
    self.send(Event::NotificationClick { action, respond })?;
    rx.await.map_err(|_| eyre!("Click event dropped"))
  }
}
