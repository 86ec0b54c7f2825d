//! Immutable snapshots of the agency tree.
//!
//! A snapshot wraps one JSON value and offers `/`-separated path lookups.
//! Snapshots are cheap to clone and share; the supervisor refreshes its
//! cached snapshot once per tick and hands borrows to health checks and
//! jobs.

use std::sync::Arc;

use serde_json::Value;

/// An immutable agency tree snapshot.
#[derive(Debug, Clone)]
pub struct AgencyTree {
    root: Arc<Value>,
}

impl Default for AgencyTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl AgencyTree {
    /// Wraps a JSON value as a tree snapshot.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self { root: Arc::new(root) }
    }

    /// Returns an empty snapshot (an empty object).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }

    /// Returns the raw root value.
    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Returns true when the tree has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.root.as_ref() {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Looks up the value at a `/`-separated path.
    ///
    /// Empty segments are ignored, so `"/Plan/DBServers"` and
    /// `"Plan/DBServers"` address the same node.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = self.root.as_ref();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    /// Returns true when a node exists at the path.
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Returns the string leaf at the path, if any.
    #[must_use]
    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Returns the unsigned-integer leaf at the path, if any.
    #[must_use]
    pub fn u64_at(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    /// Returns the boolean leaf at the path, if any.
    #[must_use]
    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Returns the array at the path, if any.
    #[must_use]
    pub fn array_at(&self, path: &str) -> Option<&Vec<Value>> {
        self.get(path).and_then(Value::as_array)
    }

    /// Iterates the children of the object at the path, sorted by key.
    ///
    /// Returns an empty iterator when the path is missing or not an object.
    pub fn children(&self, path: &str) -> impl Iterator<Item = (&str, &Value)> {
        let mut entries: Vec<(&str, &Value)> = self
            .get(path)
            .and_then(Value::as_object)
            .map(|map| map.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        entries.sort_by_key(|(k, _)| *k);
        entries.into_iter()
    }

    /// Returns the string elements of the array at the path.
    ///
    /// Non-string elements are skipped.
    #[must_use]
    pub fn string_list(&self, path: &str) -> Vec<String> {
        self.array_at(path)
            .map(|items| {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            })
            .unwrap_or_default()
    }
}
