//! Version lifecycle: install, wait, activate, retire.
//!
//! One manager governs which cache generation is current. Install and
//! activation are serialized behind a single async lock so namespace
//! transitions happen one at a time, whichever task triggers them.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{request_key, CacheEntry, CacheStore};
use crate::config::{Config, InstallMode};
use crate::net::{Network, Request};

const META_ACTIVE: &str = "active_version";
const META_WAITING: &str = "waiting_version";

/// Lifecycle phase of one controller version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Installing,
  /// Installed, waiting for the previous version to let go
  Waiting,
  Active,
  /// Replaced by a newer version, or failed to install
  Redundant,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Phase::Installing => write!(f, "installing"),
      Phase::Waiting => write!(f, "waiting"),
      Phase::Active => write!(f, "active"),
      Phase::Redundant => write!(f, "redundant"),
    }
  }
}

/// The static and dynamic namespace names of one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
  pub static_name: String,
  pub dynamic_name: String,
}

impl Namespaces {
  pub fn for_version(prefix: &str, version: &str) -> Self {
    Self {
      static_name: format!("{}-static-{}", prefix, version),
      dynamic_name: format!("{}-dynamic-{}", prefix, version),
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.static_name == name || self.dynamic_name == name
  }
}

/// Open pages and the version controlling each.
#[derive(Debug, Default)]
pub struct ClientRegistry {
  clients: Mutex<BTreeMap<String, Option<String>>>,
}

impl ClientRegistry {
  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Option<String>>> {
    // the map is always left consistent, so a poisoned lock is still usable
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Track a client; an already known client keeps its controller.
  pub fn register(&self, client_id: &str, controller: Option<String>) {
    self
      .lock()
      .entry(client_id.to_string())
      .or_insert(controller);
  }

  pub fn controller_of(&self, client_id: &str) -> Option<String> {
    self.lock().get(client_id).cloned().flatten()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  /// Take control of every open client without a reload.
  fn claim(&self, version: &str) -> usize {
    let mut clients = self.lock();
    for controller in clients.values_mut() {
      *controller = Some(version.to_string());
    }
    clients.len()
  }
}

#[derive(Debug, Default)]
struct LifecycleState {
  phases: BTreeMap<String, Phase>,
  active: Option<String>,
  waiting: Option<String>,
}

pub struct LifecycleManager {
  prefix: String,
  version: String,
  manifest: Vec<Url>,
  mode: InstallMode,
  skip_waiting: bool,
  ignore_query: bool,
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  state: Mutex<LifecycleState>,
  transitions: tokio::sync::Mutex<()>,
  clients: ClientRegistry,
}

impl LifecycleManager {
  /// Create the manager for the configured version, restoring persisted state.
  pub fn new(config: &Config, store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Result<Self> {
    let manifest = config
      .static_manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let mut state = LifecycleState {
      active: store.get_meta(META_ACTIVE)?,
      waiting: store.get_meta(META_WAITING)?,
      ..LifecycleState::default()
    };
    if let Some(active) = &state.active {
      state.phases.insert(active.clone(), Phase::Active);
    }
    if let Some(waiting) = &state.waiting {
      state.phases.insert(waiting.clone(), Phase::Waiting);
    }

    Ok(Self {
      prefix: config.cache_prefix.clone(),
      version: config.version.clone(),
      manifest,
      mode: config.install.mode,
      skip_waiting: config.install.skip_waiting,
      ignore_query: config.ignore_query,
      store,
      network,
      state: Mutex::new(state),
      transitions: tokio::sync::Mutex::new(()),
      clients: ClientRegistry::default(),
    })
  }

  fn state(&self) -> MutexGuard<'_, LifecycleState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// This process's version token.
  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn phase(&self) -> Option<Phase> {
    self.phase_of(&self.version)
  }

  pub fn phase_of(&self, version: &str) -> Option<Phase> {
    self.state().phases.get(version).copied()
  }

  pub fn active_version(&self) -> Option<String> {
    self.state().active.clone()
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.state().waiting.clone()
  }

  pub fn namespaces_for(&self, version: &str) -> Namespaces {
    Namespaces::for_version(&self.prefix, version)
  }

  /// Namespaces of the active version, if any version is active.
  pub fn active_namespaces(&self) -> Option<Namespaces> {
    self.active_version().map(|v| self.namespaces_for(&v))
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  /// Register an open page; a new page is controlled by the active version, if any.
  pub fn connect_client(&self, client_id: &str) {
    self.clients.register(client_id, self.active_version());
  }

  /// Whether `name` is a namespace owned by this controller.
  pub fn owns(&self, name: &str) -> bool {
    name
      .strip_prefix(&self.prefix)
      .is_some_and(|rest| rest.starts_with('-'))
  }

  /// Store `entry` only while `namespace` belongs to the active generation.
  ///
  /// Runs under the state lock that activation and cache clearing hold while
  /// deleting namespaces, so a write racing a transition either lands before
  /// the deletion or is skipped. Returns whether the entry was stored.
  pub fn put_current(&self, namespace: &str, entry: &CacheEntry) -> Result<bool> {
    let state = self.state();
    let current = state
      .active
      .as_deref()
      .is_some_and(|v| self.namespaces_for(v).contains(namespace));
    if !current {
      debug!(namespace, key = %entry.key, "generation moved on, skipping cache write");
      return Ok(false);
    }
    self.store.put(namespace, entry)
  }

  fn set_phase(&self, version: &str, phase: Phase) {
    debug!(version, %phase, "lifecycle transition");
    self.state().phases.insert(version.to_string(), phase);
  }

  /// Install this version: pre-populate its static namespace, then wait or activate.
  ///
  /// A version activates straight away when `skip_waiting` is configured or
  /// when no version is active yet. A failed install leaves the version
  /// redundant; there is no automatic retry.
  pub async fn install(&self) -> Result<Phase> {
    let _guard = self.transitions.lock().await;
    let version = self.version.clone();
    let namespaces = self.namespaces_for(&version);

    if self.active_version().as_deref() == Some(version.as_str()) {
      info!(version, "version already active, refreshing static namespace");
      self.precache(&namespaces.static_name).await?;
      return Ok(Phase::Active);
    }

    self.set_phase(&version, Phase::Installing);
    info!(version, entries = self.manifest.len(), "installing");

    match self.precache(&namespaces.static_name).await {
      Ok(stored) => info!(version, stored, "install complete"),
      Err(e) => {
        self.set_phase(&version, Phase::Redundant);
        warn!(version, "install failed: {}", e);
        return Err(e);
      }
    }

    self.set_phase(&version, Phase::Waiting);
    self.state().waiting = Some(version.clone());
    self.store.set_meta(META_WAITING, Some(&version))?;

    if self.skip_waiting || self.active_version().is_none() {
      self.activate_locked(&version)?;
    }

    Ok(self.phase().unwrap_or(Phase::Waiting))
  }

  /// Fetch every manifest entry and store it in `namespace`.
  ///
  /// Fetches run concurrently and the results are written in one batch. In
  /// atomic mode nothing is stored unless every fetch succeeded with a 2xx.
  pub async fn precache(&self, namespace: &str) -> Result<usize> {
    let requests: Vec<Request> = self
      .manifest
      .iter()
      .map(|url| Request::get(url.clone()))
      .collect();

    let results = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    let mut failures = Vec::new();
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_success() => {
          fetched.push(CacheEntry::from_response(
            request_key(request, self.ignore_query),
            &response,
          ));
        }
        Ok(response) => failures.push(format!("{} returned {}", request.url, response.status)),
        Err(e) => failures.push(e.to_string()),
      }
    }

    if !failures.is_empty() {
      match self.mode {
        InstallMode::Atomic => {
          return Err(eyre!(
            "Failed to pre-populate {}: {} of {} manifest entries unavailable ({})",
            namespace,
            failures.len(),
            requests.len(),
            failures.join("; ")
          ));
        }
        InstallMode::BestEffort => {
          for failure in &failures {
            warn!(namespace, "skipping manifest entry: {}", failure);
          }
        }
      }
    }

    self.store.put_batch(namespace, &fetched)
  }

  /// Activate the waiting version now. Returns false when nothing is waiting.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let _guard = self.transitions.lock().await;
    let waiting = match self.waiting_version() {
      Some(w) => Some(w),
      None => self.store.get_meta(META_WAITING)?,
    };

    match waiting {
      Some(version) => {
        self.activate_locked(&version)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Make `version` authoritative. Callers hold the transition lock.
  ///
  /// Deletes every owned namespace outside the new generation (failures are
  /// logged and skipped), retires the previous version and claims all clients.
  fn activate_locked(&self, version: &str) -> Result<()> {
    let keep = self.namespaces_for(version);

    {
      let mut state = self.state();
      match self.store.namespaces() {
        Ok(names) => {
          for name in names.iter().filter(|n| self.owns(n) && !keep.contains(n)) {
            match self.store.delete_namespace(name) {
              Ok(_) => info!(namespace = %name, "deleted stale namespace"),
              Err(e) => warn!(namespace = %name, "failed to delete stale namespace: {}", e),
            }
          }
        }
        Err(e) => warn!("failed to enumerate namespaces during activation: {}", e),
      }

      if let Some(previous) = state.active.take() {
        if previous != version {
          state.phases.insert(previous, Phase::Redundant);
        }
      }
      state.phases.insert(version.to_string(), Phase::Active);
      state.active = Some(version.to_string());
      if state.waiting.as_deref() == Some(version) {
        state.waiting = None;
      }
    }

    self.store.set_meta(META_ACTIVE, Some(version))?;
    self.store.set_meta(META_WAITING, None)?;

    let claimed = self.clients.claim(version);
    info!(version, claimed, "activated");
    Ok(())
  }

  /// Delete every namespace this controller owns, whatever its role or version.
  pub async fn clear_all(&self) -> Result<usize> {
    let _guard = self.transitions.lock().await;
    self.clear_locked()
  }

  /// Clear every owned namespace, then re-populate the active generation's
  /// static namespace. No other transition can run in between.
  pub async fn force_update(&self) -> Result<usize> {
    let _guard = self.transitions.lock().await;
    self.clear_locked()?;
    let version = self.active_version().unwrap_or_else(|| self.version.clone());
    let namespaces = self.namespaces_for(&version);
    self.precache(&namespaces.static_name).await
  }

  fn clear_locked(&self) -> Result<usize> {
    let _state = self.state();
    let mut deleted = 0;
    for name in self.store.namespaces()?.iter().filter(|n| self.owns(n)) {
      match self.store.delete_namespace(name) {
        Ok(true) => deleted += 1,
        Ok(false) => {}
        Err(e) => warn!(namespace = %name, "failed to delete namespace: {}", e),
      }
    }
    info!(deleted, "cleared caches");
    Ok(deleted)
  }
}
