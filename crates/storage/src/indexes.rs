//! Primary and secondary indexes.
//!
//! The primary index maps document keys to the current revision. Secondary
//! indexes map attribute values (or edge endpoints) to revisions. All index
//! structures are guarded by the collection's write lock; none of them
//! carry interior locks.

use std::collections::HashMap;

use arbor_types::RevisionId;

use crate::document::{AttrValue, StoredDocument};
use crate::error::{Error, Result};

/// The primary index: document key → current revision.
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    map: HashMap<String, RevisionId>,
}

impl PrimaryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index sized for roughly `capacity` keys.
    #[must_use]
    pub fn with_size_hint(capacity: usize) -> Self {
        Self { map: HashMap::with_capacity(capacity) }
    }

    /// Inserts a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UniqueConstraintViolated`] when the key is already
    /// present.
    pub fn insert_key(&mut self, key: &str, revision: RevisionId) -> Result<()> {
        if self.map.contains_key(key) {
            return Err(Error::UniqueConstraintViolated { index: "primary".to_string() });
        }
        self.map.insert(key.to_string(), revision);
        Ok(())
    }

    /// Looks up the current revision of a key.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<RevisionId> {
        self.map.get(key).copied()
    }

    /// Updates the revision of an existing key in place.
    ///
    /// Returns the previous revision, or `None` when the key is absent.
    pub fn update_revision(&mut self, key: &str, revision: RevisionId) -> Option<RevisionId> {
        self.map.get_mut(key).map(|slot| std::mem::replace(slot, revision))
    }

    /// Removes a key.
    ///
    /// Returns the removed revision, or `None` when the key was absent.
    pub fn remove_key(&mut self, key: &str) -> Option<RevisionId> {
        self.map.remove(key)
    }

    /// Number of live documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates all key → revision pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, RevisionId)> {
        self.map.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A secondary index over document attributes.
pub trait SecondaryIndex: Send + Sync {
    /// Index name (for error reporting).
    fn name(&self) -> &str;

    /// Indexes one document revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UniqueConstraintViolated`] on a unique conflict.
    /// Rollback inserts (`is_rollback = true`) must not fail.
    fn insert(&mut self, revision: RevisionId, document: &StoredDocument, is_rollback: bool)
    -> Result<()>;

    /// Removes one document revision.
    ///
    /// # Errors
    ///
    /// Implementations report internal inconsistencies; removal of an
    /// unindexed revision is not an error.
    fn remove(&mut self, revision: RevisionId, document: &StoredDocument, is_rollback: bool)
    -> Result<()>;
}

/// Hash index over a fixed list of attributes, optionally unique.
pub struct HashIndex {
    name: String,
    fields: Vec<String>,
    unique: bool,
    map: HashMap<Vec<u8>, Vec<RevisionId>>,
}

impl HashIndex {
    /// Creates a hash index over the given attribute paths.
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<String>, unique: bool) -> Self {
        Self { name: name.into(), fields, unique, map: HashMap::new() }
    }

    fn key_of(&self, document: &StoredDocument) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in &self.fields {
            let value = document.shard_key_value(field);
            // Length-prefixed debug rendering keeps distinct value tuples
            // distinct.
            let rendered = format!("{value:?}");
            buf.extend_from_slice(&(rendered.len() as u32).to_le_bytes());
            buf.extend_from_slice(rendered.as_bytes());
        }
        buf
    }

    /// Revisions currently indexed under the document's field values.
    #[must_use]
    pub fn lookup(&self, document: &StoredDocument) -> Vec<RevisionId> {
        self.map.get(&self.key_of(document)).cloned().unwrap_or_default()
    }

    /// Number of distinct value tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl SecondaryIndex for HashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(
        &mut self,
        revision: RevisionId,
        document: &StoredDocument,
        is_rollback: bool,
    ) -> Result<()> {
        let key = self.key_of(document);
        let bucket = self.map.entry(key).or_default();
        if self.unique && !is_rollback && !bucket.is_empty() {
            return Err(Error::UniqueConstraintViolated { index: self.name.clone() });
        }
        bucket.push(revision);
        Ok(())
    }

    fn remove(
        &mut self,
        revision: RevisionId,
        document: &StoredDocument,
        _is_rollback: bool,
    ) -> Result<()> {
        let key = self.key_of(document);
        if let Some(bucket) = self.map.get_mut(&key) {
            bucket.retain(|r| *r != revision);
            if bucket.is_empty() {
                self.map.remove(&key);
            }
        }
        Ok(())
    }
}

/// Edge index over `_from` and `_to`.
#[derive(Default)]
pub struct EdgeIndex {
    from: HashMap<String, Vec<RevisionId>>,
    to: HashMap<String, Vec<RevisionId>>,
}

impl EdgeIndex {
    /// Creates an empty edge index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Revisions of edges leaving `vertex`.
    #[must_use]
    pub fn outbound(&self, vertex: &str) -> Vec<RevisionId> {
        self.from.get(vertex).cloned().unwrap_or_default()
    }

    /// Revisions of edges arriving at `vertex`.
    #[must_use]
    pub fn inbound(&self, vertex: &str) -> Vec<RevisionId> {
        self.to.get(vertex).cloned().unwrap_or_default()
    }
}

impl SecondaryIndex for EdgeIndex {
    fn name(&self) -> &str {
        "edge"
    }

    fn insert(
        &mut self,
        revision: RevisionId,
        document: &StoredDocument,
        _is_rollback: bool,
    ) -> Result<()> {
        let (Some(from), Some(to)) = (&document.from, &document.to) else {
            return Err(Error::KeyBad { reason: "edge document requires _from and _to".to_string() });
        };
        self.from.entry(from.clone()).or_default().push(revision);
        self.to.entry(to.clone()).or_default().push(revision);
        Ok(())
    }

    fn remove(
        &mut self,
        revision: RevisionId,
        document: &StoredDocument,
        _is_rollback: bool,
    ) -> Result<()> {
        if let Some(from) = &document.from {
            if let Some(bucket) = self.from.get_mut(from) {
                bucket.retain(|r| *r != revision);
                if bucket.is_empty() {
                    self.from.remove(from);
                }
            }
        }
        if let Some(to) = &document.to {
            if let Some(bucket) = self.to.get_mut(to) {
                bucket.retain(|r| *r != revision);
                if bucket.is_empty() {
                    self.to.remove(to);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::document::new_object_for_insert;

    fn doc(key: &str, rev: u64, attrs: serde_json::Value) -> StoredDocument {
        new_object_for_insert(&attrs, key.to_string(), 1, false, RevisionId::new(rev)).unwrap()
    }

    fn edge(key: &str, rev: u64, from: &str, to: &str) -> StoredDocument {
        new_object_for_insert(
            &json!({"_from": from, "_to": to}),
            key.to_string(),
            1,
            true,
            RevisionId::new(rev),
        )
        .unwrap()
    }

    #[test]
    fn test_primary_insert_lookup_remove() {
        let mut index = PrimaryIndex::new();
        index.insert_key("a", RevisionId::new(1)).unwrap();
        assert_eq!(index.lookup("a"), Some(RevisionId::new(1)));
        assert!(index.insert_key("a", RevisionId::new(2)).is_err());
        assert_eq!(index.update_revision("a", RevisionId::new(2)), Some(RevisionId::new(1)));
        assert_eq!(index.lookup("a"), Some(RevisionId::new(2)));
        assert_eq!(index.remove_key("a"), Some(RevisionId::new(2)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_hash_index_non_unique_allows_duplicates() {
        let mut index = HashIndex::new("byCity", vec!["city".to_string()], false);
        let d1 = doc("a", 1, json!({"city": "berlin"}));
        let d2 = doc("b", 2, json!({"city": "berlin"}));
        index.insert(RevisionId::new(1), &d1, false).unwrap();
        index.insert(RevisionId::new(2), &d2, false).unwrap();
        assert_eq!(index.lookup(&d1).len(), 2);
    }

    #[test]
    fn test_hash_index_unique_rejects_duplicate() {
        let mut index = HashIndex::new("byEmail", vec!["email".to_string()], true);
        let d1 = doc("a", 1, json!({"email": "x@y"}));
        let d2 = doc("b", 2, json!({"email": "x@y"}));
        index.insert(RevisionId::new(1), &d1, false).unwrap();
        let err = index.insert(RevisionId::new(2), &d2, false).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
        // Rollback inserts bypass the constraint.
        index.insert(RevisionId::new(2), &d2, true).unwrap();
    }

    #[test]
    fn test_hash_index_remove() {
        let mut index = HashIndex::new("byCity", vec!["city".to_string()], false);
        let d1 = doc("a", 1, json!({"city": "rome"}));
        index.insert(RevisionId::new(1), &d1, false).unwrap();
        index.remove(RevisionId::new(1), &d1, false).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_edge_index() {
        let mut index = EdgeIndex::new();
        let e1 = edge("e1", 1, "v/a", "v/b");
        let e2 = edge("e2", 2, "v/a", "v/c");
        index.insert(RevisionId::new(1), &e1, false).unwrap();
        index.insert(RevisionId::new(2), &e2, false).unwrap();
        assert_eq!(index.outbound("v/a").len(), 2);
        assert_eq!(index.inbound("v/b"), vec![RevisionId::new(1)]);
        index.remove(RevisionId::new(1), &e1, false).unwrap();
        assert_eq!(index.outbound("v/a"), vec![RevisionId::new(2)]);
        assert!(index.inbound("v/b").is_empty());
    }

    #[test]
    fn test_edge_index_rejects_non_edge() {
        let mut index = EdgeIndex::new();
        let plain = doc("a", 1, json!({}));
        assert!(index.insert(RevisionId::new(1), &plain, false).is_err());
    }
}
