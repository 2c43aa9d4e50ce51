//! Key-value store backends.
//!
//! The session layer only needs a handful of primitives from its store:
//! raw reads, atomic create-if-absent, upsert with a TTL, delete, and a
//! per-node stats probe. [`CacheStore`] captures exactly that, so the
//! session logic can run against memcached in production and against
//! [`MemoryStore`] in tests.

mod memcached;
mod memory;

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

pub use memcached::MemcacheStore;
pub use memory::MemoryStore;

/// Statistics reported by each store node, keyed by node address.
///
/// A node that did not answer reports `None`.
pub type NodeStats = Vec<(String, Option<HashMap<String, String>>)>;

/// Errors raised by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The node could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The node answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any other client-side failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifetime of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// The record lives until evicted by the store.
    #[default]
    Never,
    /// The record expires after the given duration.
    After(Duration),
}

impl Expiry {
    /// TTL for a record backing a cookie that lives `expire_after` seconds.
    ///
    /// One extra second keeps the record alive strictly longer than the
    /// cookie that points at it.
    pub fn buffered(expire_after: Option<u64>) -> Self {
        match expire_after {
            Some(secs) => Expiry::After(Duration::from_secs(secs.saturating_add(1))),
            None => Expiry::Never,
        }
    }

    /// Whole seconds until expiry, `0` meaning never.
    pub fn as_secs(&self) -> u64 {
        match self {
            Expiry::Never => 0,
            Expiry::After(d) => d.as_secs(),
        }
    }
}

/// Store collaborator used by the session layer.
pub trait CacheStore: Send + Sync {
    /// Read the raw bytes stored at `key`.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Check whether anything is stored at `key` without decoding it.
    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Store `value` only if `key` is unused.
    ///
    /// Returns `false` when the key already exists.
    fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<bool>;

    /// Store `value` unconditionally.
    fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<()>;

    /// Remove `key`. Returns whether a record was removed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Per-node statistics, used as a health probe.
    fn stats(&self) -> StoreResult<NodeStats>;
}

impl<T: CacheStore + ?Sized> CacheStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        (**self).exists(key)
    }

    fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<bool> {
        (**self).add(key, value, expiry)
    }

    fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<()> {
        (**self).set(key, value, expiry)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        (**self).delete(key)
    }

    fn stats(&self) -> StoreResult<NodeStats> {
        (**self).stats()
    }
}
