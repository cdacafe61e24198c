//! Fetch-resolution strategies.
//!
//! Every strategy resolves to exactly one response: a cache hit, a live
//! network response, or a fallback. Network failures never escape; cache
//! writes are best-effort and only logged when they fail. A write whose
//! namespace was retired while the fetch was in flight is dropped.

use color_eyre::Result;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{body_digest, request_key, CacheEntry, CacheStore, Resolution};
use crate::classify::ResourceClass;
use crate::config::Config;
use crate::lifecycle::{LifecycleManager, Namespaces};
use crate::net::{Network, Request, Response};

/// Inline SVG served when an image cannot be loaded from cache or network.
const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#e5e7eb"/><path d="M60 140l30-40 25 30 15-20 30 30z" fill="#9ca3af"/><circle cx="75" cy="70" r="12" fill="#9ca3af"/><text x="100" y="180" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Offline</text></svg>"##;

/// Strategy engine shared by every fetch task. Cloning is cheap.
#[derive(Clone)]
pub struct StrategyEngine {
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  lifecycle: Arc<LifecycleManager>,
  ignore_query: bool,
  offline_shell: Url,
  max_dynamic_entries: usize,
}

impl StrategyEngine {
  pub fn new(
    config: &Config,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    lifecycle: Arc<LifecycleManager>,
  ) -> Result<Self> {
    Ok(Self {
      store,
      network,
      lifecycle,
      ignore_query: config.ignore_query,
      offline_shell: config.resolve(&config.offline_shell)?,
      max_dynamic_entries: config.max_dynamic_entries,
    })
  }

  /// Resolve a classified request with the strategy for its class.
  pub async fn resolve(
    &self,
    class: ResourceClass,
    request: &Request,
    namespaces: &Namespaces,
  ) -> Resolution {
    match class {
      ResourceClass::PrecachedStatic => self.cache_first(request, namespaces).await,
      ResourceClass::ExternalImmutable => self.stale_while_revalidate(request, namespaces).await,
      ResourceClass::Image => self.image(request, namespaces).await,
      ResourceClass::Dynamic => self.network_first(request, namespaces).await,
    }
  }

  /// Cache-first against the static namespace.
  ///
  /// 1. Stored entry: return it, no network hit
  /// 2. Otherwise fetch; a 200 is written through before returning
  /// 3. On network failure, navigations get the offline shell, anything else a 503
  pub async fn cache_first(&self, request: &Request, namespaces: &Namespaces) -> Resolution {
    let key = self.key(request);
    if let Some(entry) = self.lookup(&namespaces.static_name, &key) {
      debug!(%key, "cache-first hit");
      return Resolution::from_cache(entry);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.write_through(&namespaces.static_name, &key, &response);
        }
        Resolution::from_network(response)
      }
      Err(e) => {
        warn!(%key, "cache-first network failure: {}", e);
        if request.is_navigation() {
          let shell = request_key(&Request::get(self.offline_shell.clone()), self.ignore_query);
          if let Some(entry) = self.lookup(&namespaces.static_name, &shell) {
            return Resolution::fallback(entry.to_response());
          }
        }
        Resolution::fallback(offline_text())
      }
    }
  }

  /// Network-first against the dynamic namespace.
  ///
  /// Only GET 200 responses are written through; every other live response is
  /// passed on untouched. On network failure the stored entry is served, or a
  /// JSON 503 when there is none.
  pub async fn network_first(&self, request: &Request, namespaces: &Namespaces) -> Resolution {
    let key = self.key(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 && request.method == Method::GET {
          self.write_dynamic(&namespaces.dynamic_name, &key, &response);
        }
        Resolution::from_network(response)
      }
      Err(e) => {
        warn!(%key, "network-first failure, trying cache: {}", e);
        match self.lookup_any(namespaces, &key) {
          Some(entry) => Resolution::from_cache(entry),
          None => Resolution::fallback(offline_json()),
        }
      }
    }
  }

  /// Stale-while-revalidate against the dynamic namespace.
  ///
  /// A stored entry is returned at once while a background task refreshes it;
  /// the task handle rides along in [`Resolution::refresh`]. Without a stored
  /// entry the fetch is awaited inline.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    namespaces: &Namespaces,
  ) -> Resolution {
    let key = self.key(request);

    match self.lookup(&namespaces.dynamic_name, &key) {
      Some(entry) => {
        let engine = self.clone();
        let request = request.clone();
        let namespace = namespaces.dynamic_name.clone();
        let previous = entry.digest.clone();
        let refresh = tokio::spawn(async move {
          match engine.network.fetch(&request).await {
            Ok(response) if response.status == 200 => {
              if engine.write_dynamic(&namespace, &key, &response) {
                let changed = previous != body_digest(&response.body);
                debug!(%key, changed, "revalidated");
              }
            }
            Ok(response) => debug!(%key, status = response.status, "revalidation skipped"),
            Err(e) => warn!(%key, "revalidation failed: {}", e),
          }
        });
        Resolution::from_cache(entry).with_refresh(refresh)
      }
      None => match self.network.fetch(request).await {
        Ok(response) => {
          if response.status == 200 {
            self.write_dynamic(&namespaces.dynamic_name, &key, &response);
          }
          Resolution::from_network(response)
        }
        Err(e) => {
          warn!(%key, "stale-while-revalidate miss and network failure: {}", e);
          Resolution::fallback(offline_text())
        }
      },
    }
  }

  /// Cache-first for images, falling back to an inline placeholder with a 200.
  pub async fn image(&self, request: &Request, namespaces: &Namespaces) -> Resolution {
    let key = self.key(request);
    if let Some(entry) = self.lookup_any(namespaces, &key) {
      return Resolution::from_cache(entry);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.write_dynamic(&namespaces.dynamic_name, &key, &response);
        }
        Resolution::from_network(response)
      }
      Err(e) => {
        debug!(%key, "image unavailable, serving placeholder: {}", e);
        Resolution::fallback(placeholder_image())
      }
    }
  }

  fn key(&self, request: &Request) -> String {
    request_key(request, self.ignore_query)
  }

  /// Store read; a failing store counts as a miss.
  fn lookup(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
    match self.store.get(namespace, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(namespace, key, "cache read failed: {}", e);
        None
      }
    }
  }

  fn lookup_any(&self, namespaces: &Namespaces, key: &str) -> Option<CacheEntry> {
    self
      .lookup(&namespaces.dynamic_name, key)
      .or_else(|| self.lookup(&namespaces.static_name, key))
  }

  /// Best-effort write into the active generation. Returns whether the entry was stored.
  fn write_through(&self, namespace: &str, key: &str, response: &Response) -> bool {
    let entry = CacheEntry::from_response(key, response);
    match self.lifecycle.put_current(namespace, &entry) {
      Ok(stored) => stored,
      Err(e) => {
        warn!(namespace, key, "cache write failed: {}", e);
        false
      }
    }
  }

  /// Best-effort write into the dynamic namespace, keeping it under its cap.
  fn write_dynamic(&self, namespace: &str, key: &str, response: &Response) -> bool {
    let stored = self.write_through(namespace, key, response);
    if stored && self.max_dynamic_entries > 0 {
      match self.store.trim(namespace, self.max_dynamic_entries) {
        Ok(0) => {}
        Ok(evicted) => debug!(namespace, evicted, "trimmed dynamic namespace"),
        Err(e) => warn!(namespace, "cache trim failed: {}", e),
      }
    }
    stored
  }
}

fn offline_text() -> Response {
  Response::new(503, "Offline").with_header("content-type", "text/plain; charset=utf-8")
}

fn offline_json() -> Response {
  Response::json(
    503,
    &json!({
      "error": "Network unavailable and no cached response",
      "offline": true,
    }),
  )
}

fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG)
    .with_header("content-type", "image/svg+xml")
    .with_header("cache-control", "no-store")
}
