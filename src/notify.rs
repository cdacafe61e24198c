//! Push payload to notification translation and click routing.

use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

/// Payload delivered by the push mechanism.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  #[serde(default)]
  pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A notification ready to be shown by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub actions: Vec<NotificationAction>,
  /// Page opened on click
  pub url: String,
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "url", rename_all = "snake_case")]
pub enum ClickOutcome {
  /// Close the notification, then open or focus this page
  OpenWindow(String),
  /// Close the notification only
  Close,
}

pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "dismiss";

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
  config: NotificationConfig,
}

impl NotificationDispatcher {
  pub fn new(config: NotificationConfig) -> Self {
    Self { config }
  }

  pub fn on_push(&self, payload: &PushPayload) -> Notification {
    Notification {
      title: payload
        .title
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| self.config.app_name.clone()),
      body: payload.body.clone(),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      actions: vec![
        NotificationAction {
          action: ACTION_OPEN.to_string(),
          title: "Open".to_string(),
        },
        NotificationAction {
          action: ACTION_DISMISS.to_string(),
          title: "Dismiss".to_string(),
        },
      ],
      url: self.config.root_url.clone(),
    }
  }

  /// Route a click. Any action other than dismiss opens the root page.
  pub fn on_click(&self, action: Option<&str>) -> ClickOutcome {
    match action {
      Some(ACTION_DISMISS) => ClickOutcome::Close,
      _ => ClickOutcome::OpenWindow(self.config.root_url.clone()),
    }
  }
}
