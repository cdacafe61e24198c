//! Core traits and types for the response cache.

use chrono::{DateTime, SubsecRound, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;

use crate::net::Response;

/// A stored response. Immutable once written; a newer write replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Normalized request key (see [`super::request_key`])
  pub key: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// SHA-256 of the body, hex encoded
  pub digest: String,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Snapshot a response for storage under `key`.
  pub fn from_response(key: impl Into<String>, response: &Response) -> Self {
    Self {
      key: key.into(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      digest: body_digest(&response.body),
      // storage keeps microsecond precision
      stored_at: Utc::now().trunc_subsecs(6),
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

pub fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Trait for cache store backends.
///
/// Writes are whole-value replacements, so concurrent writers need no
/// coordination beyond the backend's own: last writer wins.
pub trait CacheStore: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &str) -> Result<()>;

  /// All namespace names, in creation order.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and every entry in it. Returns false if it did not exist.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Look up an entry.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Store an entry, opening the namespace on demand.
  ///
  /// Returns false (and stores nothing) for non-2xx entries.
  fn put(&self, namespace: &str, entry: &CacheEntry) -> Result<bool>;

  /// Store several entries in one all-or-nothing write, opening the namespace.
  ///
  /// Non-2xx entries are skipped. Returns the number stored.
  fn put_batch(&self, namespace: &str, entries: &[CacheEntry]) -> Result<usize>;

  /// Number of entries in a namespace.
  fn entry_count(&self, namespace: &str) -> Result<usize>;

  /// Evict oldest-stored entries until at most `max_entries` remain.
  /// Returns the number evicted.
  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize>;

  /// Read a controller metadata value.
  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  /// Write (or with `None`, remove) a controller metadata value.
  fn set_meta(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Stored entry
  Cache,
  /// Offline shell, placeholder image, or synthetic error
  Fallback,
}

/// Outcome of resolving one intercepted request.
#[derive(Debug)]
pub struct Resolution {
  pub response: Response,
  pub source: ResponseSource,
  /// When the entry was stored (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
  /// Background refresh still running after the response was handed out
  pub refresh: Option<JoinHandle<()>>,
}

impl Resolution {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      stored_at: None,
      refresh: None,
    }
  }

  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: ResponseSource::Cache,
      stored_at: Some(entry.stored_at),
      refresh: None,
    }
  }

  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      stored_at: None,
      refresh: None,
    }
  }

  pub fn with_refresh(mut self, refresh: JoinHandle<()>) -> Self {
    self.refresh = Some(refresh);
    self
  }
}
