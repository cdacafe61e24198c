mod cache;
mod classify;
mod config;
mod control;
mod controller;
mod event;
mod lifecycle;
mod logging;
mod net;
mod notify;
mod strategy;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::SqliteStore;
use crate::control::{ControlMessage, ControlType};
use crate::controller::Controller;
use crate::event::EventHandler;
use crate::net::{Destination, HttpNetwork, Request};
use crate::notify::PushPayload;
use crate::sync::SyncTrigger;

#[derive(Parser, Debug)]
#[command(name = "edgesync")]
#[command(about = "Offline-first edge cache and sync controller")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edgesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version (pre-populate, then wait or activate)
  Install,
  /// Resolve a request through the controller
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// document, image, script, style, font or other
    #[arg(short, long, default_value = "other")]
    destination: String,
    /// Treat as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Print the response body
    #[arg(long)]
    body: bool,
    /// Id of the page issuing the request
    #[arg(long)]
    client: Option<String>,
  },
  /// Send a control message (SKIP_WAITING, GET_VERSION, CLEAR_CACHE, FORCE_UPDATE)
  Control {
    /// Type name, or a `{"type": ..., "payload": ...}` JSON envelope
    message: String,
  },
  /// Queue a deferred mutation (JSON payload)
  Enqueue { payload: String },
  /// Replay queued mutations
  Sync {
    /// Background sync tag (default: connectivity restored)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Translate a push payload into a notification
  Push { payload: String },
  /// Route a notification click
  Click {
    #[arg(long)]
    action: Option<String>,
  },
  /// Show lifecycle phase, namespaces and queue length
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;

  let log_dir = db_path
    .parent()
    .map(|p| p.join("logs"))
    .unwrap_or_else(|| PathBuf::from("logs"));
  let _log_guard = logging::init(&log_dir, args.verbose)?;

  let store = Arc::new(SqliteStore::open(&db_path)?);
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let controller = Arc::new(Controller::with_sqlite(&config, store, network)?);

  match args.command {
    Command::Install => {
      let phase = controller.install().await?;
      println!("{} {}", controller.lifecycle().version(), phase);
    }
    Command::Fetch {
      url,
      method,
      destination,
      navigate,
      body,
      client,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let url = config.resolve(&url)?;
      let mut request = if navigate {
        Request::navigation(url)
      } else {
        Request::get(url).with_destination(destination.parse::<Destination>()?)
      }
      .with_method(method);
      request.client_id = client;

      let events = EventHandler::new(controller.clone());
      match events.fetch(request).await? {
        Some(resolution) => {
          let response = &resolution.response;
          println!(
            "{} {:?} {} bytes {}",
            response.status,
            resolution.source,
            response.body.len(),
            response.header("content-type").unwrap_or("-")
          );
          if let Some(stored_at) = resolution.stored_at {
            println!("stored at {}", stored_at.to_rfc3339());
          }
          if body {
            println!("{}", String::from_utf8_lossy(&response.body));
          }
          // let the background refresh land before the runtime shuts down
          if let Some(refresh) = resolution.refresh {
            let _ = refresh.await;
          }
        }
        None => println!("not intercepted (no active version or non-HTTP scheme)"),
      }
    }
    Command::Control { message } => {
      let port = controller.control_port();
      let message = if message.trim_start().starts_with('{') {
        ControlMessage::from_json(&message)?
      } else {
        ControlMessage::new(ControlType::parse(&message.to_uppercase()))
      };
      match port.request(message).await? {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
        None => println!("no reply"),
      }
    }
    Command::Enqueue { payload } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let item = controller.enqueue(payload).await?;
      println!("{}", serde_json::to_string_pretty(&item)?);
    }
    Command::Sync { tag } => {
      let trigger = tag.map_or(SyncTrigger::ConnectivityRestored, SyncTrigger::Tag);
      let events = EventHandler::new(controller.clone());
      match events.sync(trigger).await? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("trigger ignored"),
      }
    }
    Command::Push { payload } => {
      let payload: PushPayload =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid push payload: {}", e))?;
      let events = EventHandler::new(controller.clone());
      let notification = events.push(payload).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Click { action } => {
      let events = EventHandler::new(controller.clone());
      let outcome = events.click(action).await?;
      println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Command::Status => {
      let status = controller.status()?;
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
  }

  Ok(())
}
