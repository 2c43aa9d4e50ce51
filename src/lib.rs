//! # memcache-session
//!
//! Web session persistence in memcached.
//!
//! Session attributes live in a shared memcached pool under
//! `"<namespace>:<session id>"` rather than in process memory or in the
//! cookie itself. Each request loads a working copy together with a
//! snapshot of the stored record; on save only the keys the request
//! actually changed are written back onto a fresh read of the record, so
//! concurrent requests touching different keys do not clobber each other.
//!
//! ## Features
//!
//! - **Collision-free identifiers**: random ids probed against the store and
//!   claimed with an atomic add
//! - **Diff-based merge**: deletions and updates are replayed onto the
//!   latest stored record
//! - **Graceful degradation**: an unreachable store yields a session-less
//!   request instead of an error
//! - **Per-session locking**: optional in-process serialization for
//!   multithreaded hosts
//!
//! ## Quick Start
//!
//! ```no_run
//! use memcache_session::{SaveOptions, SessionManager, SessionOptions};
//! use std::collections::BTreeMap;
//!
//! fn main() -> memcache_session::Result<()> {
//!     // Initialize logging
//!     memcache_session::logging::try_init().ok();
//!
//!     let sessions = SessionManager::connect(
//!         &["127.0.0.1:11211"],
//!         &BTreeMap::new(),
//!         SessionOptions::default(),
//!     )?;
//!
//!     // First visit: no identifier yet
//!     let mut loaded = sessions.load(None, true)?;
//!     loaded.data.insert("user_id", 42);
//!
//!     if let Some(id) = &loaded.id {
//!         let options = SaveOptions::new().expire_after(3600);
//!         let outcome = sessions.save(id, &loaded.data, &options, true)?;
//!         println!("session cookie: {:?}", outcome.id());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use error::{Result, SessionError};
pub use session::{
    Attributes, Diff, IdSource, LoadedSession, LockScope, RandomIds, SaveOptions, SaveOutcome,
    SessionData, SessionId, SessionManager, SessionOptions,
};
pub use store::{CacheStore, Expiry, MemcacheStore, MemoryStore, StoreError};
