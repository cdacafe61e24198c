//! Versioned, namespaced response cache.
//!
//! This module provides the persistent store every strategy reads and writes:
//! - Namespaces are isolated cache generations (`<prefix>-static-<version>`,
//!   `<prefix>-dynamic-<version>`)
//! - Entries are keyed by normalized request identity (method + URL)
//! - Only successful (2xx) responses are persisted, and writes replace whole entries
//! - Small key/value metadata (active and waiting versions) lives alongside

mod key;
#[cfg(test)]
pub mod mock;
mod storage;
mod traits;

pub use key::request_key;
pub use storage::SqliteStore;
pub use traits::{body_digest, CacheEntry, CacheStore, Resolution, ResponseSource};
