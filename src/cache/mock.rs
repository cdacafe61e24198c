//! Cache store that fails on demand, for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::storage::SqliteStore;
use super::traits::{CacheEntry, CacheStore};

/// In-memory SQLite store with switchable read, write and delete failures.
pub struct FailingStore {
  inner: SqliteStore,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
  fail_deletes: Mutex<HashSet<String>>,
}

impl FailingStore {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: SqliteStore::open_in_memory().unwrap(),
      fail_reads: AtomicBool::new(false),
      fail_writes: AtomicBool::new(false),
      fail_deletes: Mutex::new(HashSet::new()),
    })
  }

  /// Make `get` fail until switched off again.
  pub fn fail_reads(&self, on: bool) {
    self.fail_reads.store(on, Ordering::SeqCst);
  }

  /// Make `put` and `put_batch` fail until switched off again.
  pub fn fail_writes(&self, on: bool) {
    self.fail_writes.store(on, Ordering::SeqCst);
  }

  /// Make deleting `namespace` fail.
  pub fn fail_delete(&self, namespace: &str) {
    self.fail_deletes.lock().unwrap().insert(namespace.to_string());
  }

  fn check_writes(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to store entry: disk full"));
    }
    Ok(())
  }
}

impl CacheStore for FailingStore {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    self.inner.open_namespace(namespace)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    self.inner.namespaces()
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    if self.fail_deletes.lock().unwrap().contains(namespace) {
      return Err(eyre!("Failed to delete namespace {}: database locked", namespace));
    }
    self.inner.delete_namespace(namespace)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to read entry {}: database corrupt", key));
    }
    self.inner.get(namespace, key)
  }

  fn put(&self, namespace: &str, entry: &CacheEntry) -> Result<bool> {
    self.check_writes()?;
    self.inner.put(namespace, entry)
  }

  fn put_batch(&self, namespace: &str, entries: &[CacheEntry]) -> Result<usize> {
    self.check_writes()?;
    self.inner.put_batch(namespace, entries)
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    self.inner.entry_count(namespace)
  }

  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize> {
    self.inner.trim(namespace, max_entries)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self.inner.get_meta(key)
  }

  fn set_meta(&self, key: &str, value: Option<&str>) -> Result<()> {
    self.inner.set_meta(key, value)
  }
}
