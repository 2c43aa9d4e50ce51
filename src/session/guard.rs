//! In-process serialization of load and save.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::SessionId;
use crate::error::SessionError;
use crate::Result;

/// Key under which every operation locks in [`LockScope::Instance`].
const INSTANCE_KEY: &str = "";

/// What the guard serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// Operations on the same identifier exclude each other.
    #[default]
    Session,
    /// Every operation on this manager excludes every other one.
    Instance,
}

/// Keyed mutual exclusion for session operations.
///
/// Held keys live in a set behind a mutex; waiters park on a condition
/// variable until the key they want is released. Only one process is
/// covered: instances sharing a store get no exclusion from this.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    scope: LockScope,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ConcurrencyGuard {
    /// Create a guard with the given scope.
    pub fn new(scope: LockScope) -> Self {
        Self {
            scope,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Scope this guard was created with.
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Block until the lock covering `id` is free, then take it.
    ///
    /// In session scope a missing identifier takes no lock: a fresh
    /// identifier is claimed through the store's atomic add instead.
    pub fn acquire(&self, id: Option<&SessionId>) -> Result<GuardToken<'_>> {
        let key = match (self.scope, id) {
            (LockScope::Instance, _) => INSTANCE_KEY.to_string(),
            (LockScope::Session, Some(id)) => id.as_str().to_string(),
            (LockScope::Session, None) => {
                return Ok(GuardToken {
                    guard: self,
                    key: None,
                })
            }
        };

        let mut held = self.held.lock().map_err(|_| SessionError::LockPoisoned)?;
        while held.contains(&key) {
            held = self
                .released
                .wait(held)
                .map_err(|_| SessionError::LockPoisoned)?;
        }
        held.insert(key.clone());
        trace!(key = %key, "Session lock acquired");

        Ok(GuardToken {
            guard: self,
            key: Some(key),
        })
    }

    /// Number of locks currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

/// Proof of a held lock; releases it on drop.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ConcurrencyGuard,
    key: Option<String>,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        // Release even if another holder panicked.
        let mut held = self
            .guard
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&key);
        drop(held);

        self.guard.released.notify_all();
        trace!(key = %key, "Session lock released");
    }
}
