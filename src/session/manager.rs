//! Session load/save protocol against a [`CacheStore`].

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::data::{Attributes, Diff, SessionData};
use super::guard::{ConcurrencyGuard, GuardToken, LockScope};
use super::id::{IdSource, RandomIds, SessionId, DEFAULT_ID_BYTES};
use crate::error::SessionError;
use crate::store::{CacheStore, Expiry, MemcacheStore, NodeStats};
use crate::Result;

/// Default key prefix.
pub const DEFAULT_NAMESPACE: &str = "rack:session";

/// Default bound on identifier generation attempts.
pub const DEFAULT_MAX_ID_ATTEMPTS: u32 = 32;

/// Stored form of a brand new session.
const EMPTY_RECORD: &[u8] = b"{}";

/// Configuration for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Prefix scoping every key this manager touches.
    pub namespace: String,
    /// What the concurrency guard serializes.
    pub lock_scope: LockScope,
    /// How many candidate identifiers to try before giving up.
    pub max_id_attempts: u32,
    /// Random bytes per generated identifier.
    pub id_bytes: usize,
    /// Log the keys each save deletes and updates.
    pub verbose: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            lock_scope: LockScope::default(),
            max_id_attempts: DEFAULT_MAX_ID_ATTEMPTS,
            id_bytes: DEFAULT_ID_BYTES,
            verbose: false,
        }
    }
}

impl SessionOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the lock scope.
    pub fn with_lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    /// Set the identifier generation bound.
    pub fn with_max_id_attempts(mut self, attempts: u32) -> Self {
        self.max_id_attempts = attempts;
        self
    }

    /// Enable or disable per-save key logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Per-save options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Seconds the session cookie lives, if it expires at all.
    pub expire_after: Option<u64>,
    /// Move the session to a fresh identifier.
    pub renew: bool,
    /// Destroy the session.
    pub drop: bool,
}

impl SaveOptions {
    /// Plain save with no expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cookie lifetime in seconds.
    pub fn expire_after(mut self, secs: u64) -> Self {
        self.expire_after = Some(secs);
        self
    }

    /// Request a fresh identifier.
    pub fn renew(mut self) -> Self {
        self.renew = true;
        self
    }

    /// Request destruction of the session.
    pub fn drop_session(mut self) -> Self {
        self.drop = true;
        self
    }
}

/// Result of [`SessionManager::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSession {
    /// Identifier now backing the session, `None` if the store was unreachable.
    pub id: Option<SessionId>,
    /// Working copy paired with its snapshot.
    pub data: SessionData,
}

impl LoadedSession {
    /// A session that is not backed by the store.
    pub fn detached() -> Self {
        Self {
            id: None,
            data: SessionData::new(),
        }
    }
}

/// Result of [`SessionManager::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The record was written under this identifier.
    Saved(SessionId),
    /// The session was destroyed; the client should forget its identifier.
    Dropped,
    /// The store was unreachable and nothing was written.
    NotPersisted,
}

impl SaveOutcome {
    /// Identifier the client should carry from now on.
    pub fn id(&self) -> Option<&SessionId> {
        match self {
            SaveOutcome::Saved(id) => Some(id),
            SaveOutcome::Dropped | SaveOutcome::NotPersisted => None,
        }
    }

    /// Whether the session was written.
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}

/// Stores web sessions in a shared cache.
///
/// `load` resolves (or creates) the record behind an identifier and hands
/// back a working copy paired with a snapshot of the record. `save`
/// re-reads the record, applies only the changes between snapshot and
/// working copy, and writes it back. Unrelated keys written by concurrent
/// requests survive; concurrent writes to the same key are last-write-wins.
pub struct SessionManager<S: CacheStore> {
    store: S,
    options: SessionOptions,
    guard: ConcurrencyGuard,
    ids: Box<dyn IdSource>,
}

impl SessionManager<MemcacheStore> {
    /// Connect to memcached and create a manager over it.
    ///
    /// `client_options` are forwarded to the memcache client. Any failure
    /// to reach the servers is reported as
    /// [`SessionError::StoreUnavailable`].
    pub fn connect<A: AsRef<str>>(
        servers: &[A],
        client_options: &BTreeMap<String, String>,
        options: SessionOptions,
    ) -> Result<Self> {
        let store = MemcacheStore::connect(servers, client_options)
            .map_err(|err| SessionError::StoreUnavailable(err.to_string()))?;
        Self::new(store, options)
    }
}

impl<S: CacheStore> SessionManager<S> {
    /// Create a manager, failing if no store node answers a stats probe.
    pub fn new(store: S, options: SessionOptions) -> Result<Self> {
        probe(&store)?;

        Ok(Self {
            ids: Box::new(RandomIds::new(options.id_bytes)),
            guard: ConcurrencyGuard::new(options.lock_scope),
            store,
            options,
        })
    }

    /// Replace the source of candidate identifiers.
    pub fn with_id_source(mut self, source: impl IdSource + 'static) -> Self {
        self.ids = Box::new(source);
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Options this manager was created with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Store key for a session identifier.
    pub fn namespaced_key(&self, id: &SessionId) -> String {
        format!("{}:{}", self.options.namespace, id)
    }

    /// Per-node statistics of the underlying store.
    pub fn health(&self) -> Result<NodeStats> {
        Ok(self.store.stats()?)
    }

    /// Read the stored record behind `id` without touching the guard.
    pub fn fetch(&self, id: &SessionId) -> Result<Option<Value>> {
        self.read_record(&self.namespaced_key(id))
    }

    /// Produce an identifier with no record behind it.
    ///
    /// Candidates are probed with a raw existence read. Gives up with
    /// [`SessionError::IdSpaceExhausted`] after `max_id_attempts` tries.
    pub fn generate_sid(&self) -> Result<SessionId> {
        let attempts = self.options.max_id_attempts.max(1);

        for attempt in 1..=attempts {
            let candidate = self.ids.generate();
            if !self.store.exists(&self.namespaced_key(&candidate))? {
                return Ok(candidate);
            }
            debug!(attempt, "Generated session id already in use");
        }

        error!(attempts, "Could not find an unused session id");
        Err(SessionError::IdSpaceExhausted { attempts })
    }

    /// Resolve `incoming` to a session, creating one if needed.
    ///
    /// When the store cannot be reached the request continues without a
    /// session: the result has no identifier and empty data. Only a lost
    /// race for a fresh identifier (or running out of identifiers) is
    /// reported as an error.
    pub fn load(
        &self,
        incoming: Option<&SessionId>,
        multithreaded: bool,
    ) -> Result<LoadedSession> {
        let _token = self.lock(incoming, multithreaded)?;

        match self.load_locked(incoming) {
            Err(SessionError::StoreOperationFailed(err)) => {
                warn!(
                    error = %err,
                    "Unable to reach memcache server, continuing without session"
                );
                Ok(LoadedSession::detached())
            }
            result => result,
        }
    }

    fn load_locked(&self, incoming: Option<&SessionId>) -> Result<LoadedSession> {
        let existing = match incoming {
            Some(id) => self
                .read_record(&self.namespaced_key(id))?
                .and_then(into_attributes)
                .map(|record| (id.clone(), record)),
            None => None,
        };

        let (id, current) = match existing {
            Some(found) => found,
            None => {
                let id = self.generate_sid()?;
                self.create_empty(&id)?;
                debug!(session_id = %id, "Created session");
                (id, Attributes::new())
            }
        };

        let snapshot = self.read_record(&self.namespaced_key(&id))?;

        Ok(LoadedSession {
            id: Some(id),
            data: SessionData::from_parts(current, snapshot),
        })
    }

    /// Write back the changes a request made to its session.
    ///
    /// `renew` moves the session to a new identifier and `drop` deletes it.
    /// An unreachable store yields [`SaveOutcome::NotPersisted`] rather
    /// than an error.
    pub fn save(
        &self,
        id: &SessionId,
        data: &SessionData,
        options: &SaveOptions,
        multithreaded: bool,
    ) -> Result<SaveOutcome> {
        let expiry = Expiry::buffered(options.expire_after);
        let _token = self.lock(Some(id), multithreaded)?;

        match self.save_locked(id, data, options, expiry) {
            Err(SessionError::StoreOperationFailed(err)) => {
                warn!(
                    session_id = %id,
                    error = %err,
                    "Unable to reach memcache server, session not saved"
                );
                Ok(SaveOutcome::NotPersisted)
            }
            result => result,
        }
    }

    fn save_locked(
        &self,
        id: &SessionId,
        data: &SessionData,
        options: &SaveOptions,
        expiry: Expiry,
    ) -> Result<SaveOutcome> {
        let mut id = id.clone();

        if options.renew || options.drop {
            self.store.delete(&self.namespaced_key(&id))?;
            if options.drop {
                debug!(session_id = %id, "Dropped session");
                return Ok(SaveOutcome::Dropped);
            }

            let renewed = self.generate_sid()?;
            self.create_empty(&renewed)?;
            debug!(old = %id, session_id = %renewed, "Renewed session");
            id = renewed;
        }

        let key = self.namespaced_key(&id);
        let mut record = match self.read_record(&key)? {
            Some(Value::Object(record)) => record,
            Some(_) => {
                warn!(session_id = %id, "Stored session is not a map, replacing it");
                Attributes::new()
            }
            None => Attributes::new(),
        };

        match snapshot_attributes(data) {
            Ok(snapshot) => {
                let diff = Diff::between(&snapshot, data.attributes());
                if self.options.verbose {
                    self.log_diff(&id, &diff);
                }
                diff.apply(&mut record);
            }
            Err(err) => {
                warn!(
                    session_id = %id,
                    error = %err,
                    "Bad snapshot or working copy, skipping merge"
                );
            }
        }

        let bytes = serde_json::to_vec(&record)?;
        self.store.set(&key, &bytes, expiry)?;
        debug!(session_id = %id, ttl = expiry.as_secs(), "Saved session");

        Ok(SaveOutcome::Saved(id))
    }

    fn lock(&self, id: Option<&SessionId>, multithreaded: bool) -> Result<Option<GuardToken<'_>>> {
        if !multithreaded {
            return Ok(None);
        }
        self.guard.acquire(id).map(Some)
    }

    /// Claim `id` with an empty record, refusing to overwrite.
    fn create_empty(&self, id: &SessionId) -> Result<()> {
        if self
            .store
            .add(&self.namespaced_key(id), EMPTY_RECORD, Expiry::Never)?
        {
            Ok(())
        } else {
            error!(session_id = %id, "Session collision");
            Err(SessionError::Collision(id.to_string()))
        }
    }

    /// Read and decode the record at `key`; undecodable bytes read as absent.
    fn read_record(&self, key: &str) -> Result<Option<Value>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                debug!(key = %key, error = %err, "Unreadable session record");
                Ok(None)
            }
        }
    }

    fn log_diff(&self, id: &SessionId, diff: &Diff) {
        if !diff.deleted.is_empty() {
            info!(session_id = %id, keys = %diff.deleted.join(","), "delete");
        }
        if !diff.updated.is_empty() {
            info!(session_id = %id, keys = %diff.updated_keys().join(","), "update");
        }
    }
}

impl<S: CacheStore + std::fmt::Debug> std::fmt::Debug for SessionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Confirm at least one store node answers.
fn probe<S: CacheStore>(store: &S) -> Result<()> {
    match store.stats() {
        Ok(stats) if stats.iter().any(|(_, values)| values.is_some()) => {
            debug!(nodes = stats.len(), "Store health probe succeeded");
            Ok(())
        }
        Ok(_) => Err(SessionError::StoreUnavailable(
            "no node answered the stats probe".into(),
        )),
        Err(err) => Err(SessionError::StoreUnavailable(err.to_string())),
    }
}

fn into_attributes(value: Value) -> Option<Attributes> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Snapshot to diff against; a missing snapshot diffs as empty.
fn snapshot_attributes(data: &SessionData) -> Result<Attributes> {
    match data.snapshot() {
        None => Ok(Attributes::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(SessionError::MalformedSession(format!(
            "snapshot is {}, expected a map",
            kind(other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}
