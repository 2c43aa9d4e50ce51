//! Session management module.
//!
//! This module provides session identifiers, the paired snapshot and
//! working copy handed to callers, the diff used to merge them back, and
//! the manager that runs the load/save protocol against a store.

mod data;
mod guard;
mod id;
mod manager;

pub use data::{Attributes, Diff, SessionData};
pub use guard::{ConcurrencyGuard, GuardToken, LockScope};
pub use id::{IdSource, RandomIds, SessionId, DEFAULT_ID_BYTES, MAX_ID_LEN};
pub use manager::{
    LoadedSession, SaveOptions, SaveOutcome, SessionManager, SessionOptions,
    DEFAULT_MAX_ID_ATTEMPTS, DEFAULT_NAMESPACE,
};
