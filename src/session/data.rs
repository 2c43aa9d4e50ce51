//! Session attributes and the snapshot they are diffed against.

use serde_json::{Map, Value};

/// Attribute map held by a session.
pub type Attributes = Map<String, Value>;

/// A session's working copy paired with the record it was loaded from.
///
/// Callers mutate the working copy freely. On save only the difference
/// between the snapshot and the working copy is written back, so keys
/// this request never touched keep whatever value another request stored
/// in the meantime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionData {
    current: Attributes,
    snapshot: Option<Value>,
}

impl SessionData {
    /// An empty working copy with no snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// A working copy paired with the record it was read from.
    pub fn with_snapshot(current: Attributes, snapshot: Value) -> Self {
        Self {
            current,
            snapshot: Some(snapshot),
        }
    }

    /// A working copy with no snapshot; every key counts as new on save.
    pub fn from_attributes(current: Attributes) -> Self {
        Self {
            current,
            snapshot: None,
        }
    }

    pub(crate) fn from_parts(current: Attributes, snapshot: Option<Value>) -> Self {
        Self { current, snapshot }
    }

    /// Record as it was when this session was loaded, if known.
    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// Current attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.current
    }

    /// Mutable access to the current attributes.
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.current
    }

    /// Get an attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.get(key)
    }

    /// Set an attribute, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.current.insert(key.into(), value.into())
    }

    /// Remove an attribute.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.current.remove(key)
    }

    /// Remove every attribute.
    pub fn clear(&mut self) {
        self.current.clear();
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Check if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

/// Changes a request made to its session, relative to its snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    /// Keys present in the snapshot but gone from the working copy.
    pub deleted: Vec<String>,
    /// Keys whose value is new or differs from the snapshot.
    pub updated: Vec<(String, Value)>,
}

impl Diff {
    /// Compute the changes from `snapshot` to `current`.
    ///
    /// Keys are listed in sorted order.
    pub fn between(snapshot: &Attributes, current: &Attributes) -> Self {
        let mut deleted: Vec<String> = snapshot
            .keys()
            .filter(|k| !current.contains_key(*k))
            .cloned()
            .collect();
        deleted.sort();

        let mut updated: Vec<(String, Value)> = current
            .iter()
            .filter(|(k, v)| snapshot.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        updated.sort_by(|a, b| a.0.cmp(&b.0));

        Self { deleted, updated }
    }

    /// Apply these changes to `record`, leaving every other key alone.
    pub fn apply(&self, record: &mut Attributes) {
        for key in &self.deleted {
            record.remove(key);
        }
        for (key, value) in &self.updated {
            record.insert(key.clone(), value.clone());
        }
    }

    /// Check if the request changed nothing.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Names of the updated keys.
    pub fn updated_keys(&self) -> Vec<&str> {
        self.updated.iter().map(|(k, _)| k.as_str()).collect()
    }
}
