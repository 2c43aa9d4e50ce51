//! In-process store backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use super::{CacheStore, Expiry, NodeStats, StoreError, StoreResult};

/// How often expired entries are swept out.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// A stored value with its optional deadline.
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &[u8], expiry: Expiry) -> Self {
        let expires_at = match expiry {
            Expiry::Never => None,
            Expiry::After(ttl) => Instant::now().checked_add(ttl),
        };
        Self {
            value: value.to_vec(),
            expires_at,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Thread-safe in-memory store with memcached-like semantics.
///
/// Useful for tests and single-process deployments. [`set_offline`]
/// makes every call fail as if the server had gone away.
///
/// [`set_offline`]: MemoryStore::set_offline
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    last_purge: RwLock<Instant>,
    offline: AtomicBool,
    total_items: AtomicU64,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            last_purge: RwLock::new(Instant::now()),
            offline: AtomicBool::new(false),
            total_items: AtomicU64::new(0),
        }
    }

    /// Simulate a server outage (or recovery).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether the store is currently simulating an outage.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|e| e.values().filter(|entry| entry.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Check if the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of `key`, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|deadline| deadline - now)
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.is_offline() {
            return Err(StoreError::Network("memory store is offline".into()));
        }
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.check_online()?;
        self.entries
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.check_online()?;
        self.maybe_purge();
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))
    }

    /// Drop expired entries if the last sweep is old enough.
    fn maybe_purge(&self) {
        let due = self
            .last_purge
            .read()
            .map(|t| t.elapsed() > PURGE_INTERVAL)
            .unwrap_or(false);

        if !due {
            return;
        }

        if let Ok(mut last) = self.last_purge.write() {
            // Double-check after acquiring lock
            if last.elapsed() <= PURGE_INTERVAL {
                return;
            }
            *last = Instant::now();

            if let Ok(mut entries) = self.entries.write() {
                let now = Instant::now();
                entries.retain(|_, entry| entry.is_live(now));
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.read()?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.write()?;

        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        entries.insert(key.to_string(), Entry::new(value, expiry));
        self.total_items.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<()> {
        let mut entries = self.write()?;
        entries.insert(key.to_string(), Entry::new(value, expiry));
        self.total_items.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.write()?;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    fn stats(&self) -> StoreResult<NodeStats> {
        self.check_online()?;

        let mut stats = HashMap::new();
        stats.insert("curr_items".to_string(), self.len().to_string());
        stats.insert(
            "total_items".to_string(),
            self.total_items.load(Ordering::Relaxed).to_string(),
        );
        stats.insert("pid".to_string(), std::process::id().to_string());

        Ok(vec![("memory".to_string(), Some(stats))])
    }
}
