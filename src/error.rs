//! Error types for memcache-session.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No store node answered the health probe.
    #[error("no memcache servers available: {0}")]
    StoreUnavailable(String),

    /// A get/add/set/delete against the store failed.
    #[error("store operation failed: {0}")]
    StoreOperationFailed(#[from] StoreError),

    /// A freshly generated identifier was claimed by another caller.
    #[error("session collision on '{0}'")]
    Collision(String),

    /// Snapshot or working copy is not a key-value mapping.
    #[error("malformed session: {0}")]
    MalformedSession(String),

    /// Every generated identifier was already taken.
    #[error("no unused session id after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },

    /// The identifier cannot be used as part of a store key.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Record encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the request can carry on without a session.
    ///
    /// Store failures and malformed data degrade to a session-less request;
    /// everything else would break session isolation if swallowed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::StoreOperationFailed(_) | SessionError::MalformedSession(_)
        )
    }
}

/// Convenience Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
