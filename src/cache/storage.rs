//! SQLite implementation of the cache store and sync queue storage.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, CacheStore};
use crate::sync::{PendingSyncItem, QueueStore};

/// SQLite-based store shared by every strategy, the lifecycle manager and the sync queue.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("edgesync").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const SCHEMA: &str = r#"
-- Cache generations
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Stored responses
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(namespace, stored_at);

-- Controller state (active/waiting version tokens)
CREATE TABLE IF NOT EXISTS controller_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Deferred mutations, FIFO by id
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;

impl CacheStore for SqliteStore {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, digest, stored_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = stmt
      .query_row(params![namespace, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, digest, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          status,
          headers,
          body,
          digest,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, entry: &CacheEntry) -> Result<bool> {
    if !entry.is_success() {
      return Ok(false);
    }
    Ok(self.put_batch(namespace, std::slice::from_ref(entry))? == 1)
  }

  fn put_batch(&self, namespace: &str, entries: &[CacheEntry]) -> Result<usize> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, format_datetime(Utc::now())],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

    let mut stored = 0;
    for entry in entries.iter().filter(|e| e.is_success()) {
      let headers = serde_json::to_string(&entry.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, request_key, status, headers, body, digest, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          entry.key,
          entry.status,
          headers,
          entry.body,
          entry.digest,
          format_datetime(entry.stored_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;
      stored += 1;
    }

    // dropping the transaction uncommitted rolls back every row above
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(stored)
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", namespace, e))?;
    Ok(count as usize)
  }

  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize> {
    let evicted = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries
         WHERE namespace = ?1 AND request_key NOT IN (
           SELECT request_key FROM cache_entries
           WHERE namespace = ?1
           ORDER BY stored_at DESC, rowid DESC
           LIMIT ?2
         )",
        params![namespace, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to trim namespace {}: {}", namespace, e))?;
    Ok(evicted)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM controller_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self.conn()?;
    match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO controller_meta (key, value) VALUES (?, ?)",
        params![key, value],
      ),
      None => conn.execute("DELETE FROM controller_meta WHERE key = ?", params![key]),
    }
    .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;
    Ok(())
  }
}

impl QueueStore for SqliteStore {
  fn push_item(&self, payload: &serde_json::Value) -> Result<PendingSyncItem> {
    let created_at = Utc::now();
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO sync_queue (payload, created_at, attempts) VALUES (?, ?, 0)",
        params![data, format_datetime(created_at)],
      )
      .map_err(|e| eyre!("Failed to enqueue sync item: {}", e))?;

    Ok(PendingSyncItem {
      id: conn.last_insert_rowid(),
      payload: payload.clone(),
      created_at,
      attempts: 0,
    })
  }

  fn items(&self) -> Result<Vec<PendingSyncItem>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, payload, created_at, attempts FROM sync_queue ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, String, u32)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read sync queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, created_at, attempts)| -> Result<PendingSyncItem> {
        Ok(PendingSyncItem {
          id,
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Failed to deserialize sync item {}: {}", id, e))?,
          created_at: parse_datetime(&created_at)?,
          attempts,
        })
      })
      .collect()
  }

  fn remove_item(&self, id: i64) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync item {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn record_attempt(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update sync item {}: {}", id, e))?;
    Ok(())
  }

  fn evict_oldest(&self, keep: usize) -> Result<usize> {
    let evicted = self
      .conn()?
      .execute(
        "DELETE FROM sync_queue WHERE id NOT IN (
           SELECT id FROM sync_queue ORDER BY id DESC LIMIT ?
         )",
        params![keep as i64],
      )
      .map_err(|e| eyre!("Failed to evict sync items: {}", e))?;
    Ok(evicted)
  }
}

/// Timestamps are stored as RFC 3339 with microseconds so they sort lexically.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
