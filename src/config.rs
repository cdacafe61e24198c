use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Version token embedded in namespace names (bump on every deployment)
  pub version: String,
  /// Prefix marking namespaces owned by this controller
  pub cache_prefix: String,
  /// Origin that root-relative manifest paths resolve against
  pub origin: String,
  /// Root-relative paths pre-populated at install time
  pub static_manifest: Vec<String>,
  /// Absolute URLs or URL prefixes served stale-while-revalidate
  pub external_resources: Vec<String>,
  /// Manifest path served to navigations when offline
  pub offline_shell: String,
  /// Drop the query string from cache keys
  pub ignore_query: bool,
  /// Upper bound on entries in the dynamic namespace
  pub max_dynamic_entries: usize,
  /// Database path (default: $XDG_DATA_HOME/edgesync/cache.db)
  pub database: Option<PathBuf>,
  pub install: InstallConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      cache_prefix: "edgesync".to_string(),
      origin: "http://localhost:3000".to_string(),
      static_manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/styles.css".to_string(),
        "/app.js".to_string(),
        "/manifest.json".to_string(),
      ],
      external_resources: Vec::new(),
      offline_shell: "/".to_string(),
      ignore_query: false,
      max_dynamic_entries: 200,
      database: None,
      install: InstallConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
  /// Any failed manifest fetch fails the whole install
  #[default]
  Atomic,
  /// Store what succeeded, log what did not
  BestEffort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  pub mode: InstallMode,
  /// Activate as soon as install succeeds instead of waiting
  pub skip_waiting: bool,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      mode: InstallMode::Atomic,
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag this controller reacts to
  pub tag: String,
  /// Server path accepting POSTed deferred mutations
  pub endpoint: String,
  /// Maximum queued items; oldest are dropped beyond this
  pub capacity: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-pending".to_string(),
      endpoint: "/api/sync".to_string(),
      capacity: 50,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Title used when a push payload has none
  pub app_name: String,
  pub icon: String,
  pub badge: String,
  /// Page opened when a notification is clicked
  pub root_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      app_name: "Edgesync".to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/badge-72.png".to_string(),
      root_url: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edgesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edgesync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  /// `EDGESYNC_ORIGIN` overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("EDGESYNC_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("edgesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edgesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.version.is_empty() {
      return Err(eyre!("Config error: version must not be empty"));
    }
    if self.cache_prefix.is_empty() {
      return Err(eyre!("Config error: cache_prefix must not be empty"));
    }
    if !self.static_manifest.iter().all(|p| p.starts_with('/')) {
      return Err(eyre!("Config error: static_manifest entries must be root-relative"));
    }
    if self.sync.capacity == 0 {
      return Err(eyre!("Config error: sync.capacity must be at least 1"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a root-relative path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStore::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
version: v7
origin: https://app.test
install:
  mode: best_effort
sync:
  capacity: 10
"#,
    )
    .unwrap();

    assert_eq!(config.version, "v7");
    assert_eq!(config.install.mode, InstallMode::BestEffort);
    assert!(config.install.skip_waiting);
    assert_eq!(config.sync.capacity, 10);
    assert_eq!(config.sync.tag, "sync-pending");
    assert_eq!(config.cache_prefix, "edgesync");
  }

  #[test]
  fn test_resolve_manifest_path() {
    let config = Config {
      origin: "https://app.test".to_string(),
      ..Config::default()
    };
    assert_eq!(
      config.resolve("/app.js").unwrap().as_str(),
      "https://app.test/app.js"
    );
    assert_eq!(config.resolve("/").unwrap().as_str(), "https://app.test/");
  }

  #[test]
  fn test_validate_rejects_relative_manifest() {
    let config = Config {
      static_manifest: vec!["app.js".to_string()],
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_zero_sync_capacity() {
    let config = Config::from_yaml("sync:\n  capacity: 0\n").unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("sync.capacity"));
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/edgesync.yaml"))).is_err());
  }
}
