//! Revision cache: maps revision ids to document positions.
//!
//! The cache is the only component that knows where a revision's document
//! body lives. A position is either the marker body of a freshly appended
//! journal entry (shared bytes) or an offset into a datafile. Position
//! validity is tied to the owning datafile's lifetime: the compactor and the
//! drop path clear the affected entries before removing a file.
//!
//! The map is sharded internally; callers never observe its locks.

use std::sync::Arc;

use dashmap::DashMap;

use arbor_types::{FileId, RevisionId};

/// Location of one revision's document body.
#[derive(Debug, Clone)]
pub enum DocumentPosition {
    /// The body as appended to the journal, still referenced in memory.
    Wal {
        /// Encoded document body.
        data: Arc<[u8]>,
    },
    /// A payload range inside a datafile.
    File {
        /// The owning datafile.
        fid: FileId,
        /// Payload offset inside the file.
        offset: u64,
        /// Payload length in bytes.
        len: u32,
    },
}

impl DocumentPosition {
    /// Whether the position still points at in-memory journal bytes.
    #[must_use]
    pub fn is_in_wal(&self) -> bool {
        matches!(self, DocumentPosition::Wal { .. })
    }

    /// The owning file id; zero for WAL-resident entries.
    #[must_use]
    pub fn fid(&self) -> FileId {
        match self {
            DocumentPosition::Wal { .. } => FileId::new(0),
            DocumentPosition::File { fid, .. } => *fid,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            DocumentPosition::Wal { data } => data.len(),
            DocumentPosition::File { len, .. } => *len as usize,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sharded map from revision ids to document positions.
#[derive(Debug, Default)]
pub struct RevisionCache {
    entries: DashMap<RevisionId, DocumentPosition>,
}

impl RevisionCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache sized for roughly `capacity` revisions.
    #[must_use]
    pub fn with_size_hint(capacity: usize) -> Self {
        Self { entries: DashMap::with_capacity(capacity) }
    }

    /// Inserts a revision; replaces silently on re-insert.
    pub fn insert(&self, revision: RevisionId, position: DocumentPosition) {
        self.entries.insert(revision, position);
    }

    /// Updates an existing revision's position (e.g. WAL → file).
    pub fn update(&self, revision: RevisionId, position: DocumentPosition) {
        self.entries.insert(revision, position);
    }

    /// Updates only when the entry still points into the WAL.
    ///
    /// Returns whether the entry was updated.
    pub fn update_conditional(&self, revision: RevisionId, position: DocumentPosition) -> bool {
        match self.entries.get_mut(&revision) {
            Some(mut entry) if entry.is_in_wal() => {
                *entry = position;
                true
            },
            _ => false,
        }
    }

    /// Looks up a revision.
    #[must_use]
    pub fn lookup(&self, revision: RevisionId) -> Option<DocumentPosition> {
        self.entries.get(&revision).map(|entry| entry.clone())
    }

    /// Whether a revision is cached.
    #[must_use]
    pub fn contains(&self, revision: RevisionId) -> bool {
        self.entries.contains_key(&revision)
    }

    /// Removes a revision without reporting it.
    pub fn remove(&self, revision: RevisionId) {
        self.entries.remove(&revision);
    }

    /// Removes a revision and returns its position for stats accounting.
    #[must_use]
    pub fn fetch_and_remove(&self, revision: RevisionId) -> Option<DocumentPosition> {
        self.entries.remove(&revision).map(|(_, position)| position)
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn wal_position(bytes: &[u8]) -> DocumentPosition {
        DocumentPosition::Wal { data: Arc::from(bytes) }
    }

    #[test]
    fn test_insert_lookup_remove() {
        let cache = RevisionCache::new();
        let rev = RevisionId::new(1);
        cache.insert(rev, wal_position(b"doc"));
        assert!(cache.contains(rev));
        assert_eq!(cache.lookup(rev).unwrap().len(), 3);
        cache.remove(rev);
        assert!(cache.lookup(rev).is_none());
    }

    #[test]
    fn test_update_conditional_only_touches_wal_entries() {
        let cache = RevisionCache::new();
        let rev = RevisionId::new(2);
        cache.insert(rev, wal_position(b"body"));
        let file_pos = DocumentPosition::File { fid: FileId::new(9), offset: 64, len: 4 };
        assert!(cache.update_conditional(rev, file_pos.clone()));
        assert!(!cache.lookup(rev).unwrap().is_in_wal());
        // A second conditional update must not fire.
        assert!(!cache.update_conditional(rev, file_pos));
    }

    #[test]
    fn test_fetch_and_remove_returns_position() {
        let cache = RevisionCache::new();
        let rev = RevisionId::new(3);
        cache.insert(rev, DocumentPosition::File { fid: FileId::new(5), offset: 128, len: 77 });
        let position = cache.fetch_and_remove(rev).unwrap();
        assert_eq!(position.fid(), FileId::new(5));
        assert_eq!(position.len(), 77);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_wal_fid_is_zero() {
        assert_eq!(wal_position(b"x").fid(), FileId::new(0));
        assert!(wal_position(b"x").is_in_wal());
    }
}
