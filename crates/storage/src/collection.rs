//! The logical collection.
//!
//! Public operations: `insert`, `update`, `replace`, `remove`, `read`.
//! Every write runs the shared pipeline: key handling, revision minting,
//! document composition, revision-cache insert, index maintenance under
//! the collection write lock, journal append, optional fsync.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use arbor_types::{CollectionId, HybridLogicalClock, RevisionId, Tick, validation};

use crate::document::{
    self, StoredDocument, extract_expected_rev, extract_key, merged_for_update,
    new_object_for_insert, new_object_for_remove, new_object_for_replace,
};
use crate::error::{Error, Result};
use crate::indexes::{PrimaryIndex, SecondaryIndex};
use crate::key_generator::KeyGenerator;
use crate::lock::{DeadlockDetector, DetectedRwLock};
use crate::marker::{MARKER_HEADER_SIZE, MarkerType, align8};
use crate::physical::{AppendResult, StorageBackend};
use crate::revision_cache::DocumentPosition;

/// Collection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Plain documents.
    Document,
    /// Edge documents carrying `_from` and `_to`.
    Edge,
}

/// Collection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Loaded and serving operations.
    Loaded,
    /// Dropped; operations fail.
    Deleted,
}

/// Static collection metadata.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    /// Local collection id.
    pub cid: CollectionId,
    /// Cluster-wide plan id (zero on single servers).
    pub plan_id: u64,
    /// Collection name.
    pub name: String,
    /// Document or edge collection.
    pub collection_type: CollectionType,
    /// Sharding attributes, 1 to 8 entries.
    pub shard_keys: Vec<String>,
    /// Desired replica count; 0 marks a satellite.
    pub replication_factor: u64,
    /// Number of shards.
    pub number_of_shards: u64,
    /// Whether writes fsync before returning by default.
    pub wait_for_sync: bool,
    /// Whether the collection lives purely in memory.
    pub is_volatile: bool,
    /// Whether this is a system collection (`_`-prefixed name).
    pub is_system: bool,
    /// Journal target size in bytes.
    pub journal_size: u64,
}

impl CollectionInfo {
    /// Validates the metadata invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a bad name or shard-key list and
    /// [`Error::Corrupted`] for the volatile/waitForSync conflict.
    pub fn validate(&self) -> Result<()> {
        validation::validate_collection_name(&self.name, self.is_system)?;
        validation::validate_shard_keys(&self.shard_keys)?;
        if self.is_volatile && self.wait_for_sync {
            return Err(Error::Corrupted {
                reason: "volatile collections cannot waitForSync".to_string(),
            });
        }
        Ok(())
    }

    /// The id stored inside `_id`: the plan id on data nodes, else the cid.
    #[must_use]
    pub fn id_target(&self) -> u64 {
        if self.plan_id != 0 { self.plan_id } else { self.cid.value() }
    }
}

/// Per-operation options.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Fsync the journal before returning.
    pub wait_for_sync: bool,
    /// Skip the expected-revision check.
    pub ignore_revs: bool,
    /// Restore mode: ingest incoming revisions and keys verbatim.
    pub is_restore: bool,
    /// Merge patch objects into existing ones instead of replacing.
    pub merge_objects: bool,
    /// Keep explicit nulls instead of removing the attribute.
    pub keep_null: bool,
    /// Replay an externally produced document instead of composing one.
    pub recovery_marker: Option<StoredDocument>,
}

impl OperationOptions {
    /// Default options for updates: merge objects, keep nulls.
    #[must_use]
    pub fn update_defaults() -> Self {
        Self { merge_objects: true, keep_null: true, ..Self::default() }
    }
}

/// Result of one operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// The document key.
    pub key: String,
    /// Revision written (for removes: the removal revision).
    pub revision: RevisionId,
    /// The superseded revision, if any.
    pub old_revision: Option<RevisionId>,
    /// The resulting document (reads and writes; absent for removes).
    pub document: Option<Value>,
}

/// The index set guarded by the collection write lock.
pub struct IndexSet {
    /// Position 0 of the logical index list.
    pub primary: PrimaryIndex,
    /// Secondary indexes in creation order.
    pub secondaries: Vec<Box<dyn SecondaryIndex>>,
}

/// A logical collection bound to its physical store.
pub struct Collection {
    info: CollectionInfo,
    status: RwLock<CollectionStatus>,
    physical: Box<dyn StorageBackend>,
    clock: Arc<HybridLogicalClock>,
    key_generator: Box<dyn KeyGenerator>,
    indexes: DetectedRwLock<IndexSet>,
}

impl Collection {
    /// Creates a collection over a physical store.
    ///
    /// # Errors
    ///
    /// Returns validation errors for inconsistent metadata.
    pub fn new(
        info: CollectionInfo,
        physical: Box<dyn StorageBackend>,
        clock: Arc<HybridLogicalClock>,
        key_generator: Box<dyn KeyGenerator>,
        secondaries: Vec<Box<dyn SecondaryIndex>>,
        detector: Arc<DeadlockDetector>,
        lock_timeout: Duration,
    ) -> Result<Self> {
        info.validate()?;
        let indexes = DetectedRwLock::new(
            info.cid.value(),
            IndexSet { primary: PrimaryIndex::new(), secondaries },
            detector,
            lock_timeout,
        );
        Ok(Self {
            info,
            status: RwLock::new(CollectionStatus::Loaded),
            physical,
            clock,
            key_generator,
            indexes,
        })
    }

    /// The collection metadata.
    #[must_use]
    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    /// The physical store.
    #[must_use]
    pub fn physical(&self) -> &dyn StorageBackend {
        self.physical.as_ref()
    }

    /// The key generator.
    #[must_use]
    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// The process clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }

    /// The guarded index set (recovery and tests).
    #[must_use]
    pub fn indexes(&self) -> &DetectedRwLock<IndexSet> {
        &self.indexes
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> CollectionStatus {
        *self.status.read()
    }

    /// Marks the collection dropped.
    pub fn mark_deleted(&self) {
        *self.status.write() = CollectionStatus::Deleted;
    }

    /// Number of live documents.
    ///
    /// # Errors
    ///
    /// Surfaces lock acquisition failures.
    pub fn document_count(&self) -> Result<usize> {
        Ok(self.indexes.read()?.primary.len())
    }

    fn check_loaded(&self) -> Result<()> {
        match self.status() {
            CollectionStatus::Loaded => Ok(()),
            CollectionStatus::Deleted => Err(Error::CollectionNotFound),
        }
    }

    fn is_edge(&self) -> bool {
        self.info.collection_type == CollectionType::Edge
    }

    /// Dereferences a revision through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRevision`] for a revision the cache does not
    /// know.
    pub fn read_revision(&self, revision: RevisionId) -> Result<StoredDocument> {
        let position = self
            .physical
            .revision_cache()
            .lookup(revision)
            .ok_or(Error::InvalidRevision { revision })?;
        let bytes = self.physical.read_document(&position)?;
        StoredDocument::from_bytes(&bytes)
    }

    /// Reads a document by key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DocumentNotFound`] for an unknown key.
    pub fn read(&self, key: &str) -> Result<OperationResult> {
        self.check_loaded()?;
        let indexes = self.indexes.read()?;
        let revision = indexes.primary.lookup(key).ok_or(Error::DocumentNotFound)?;
        let document = self.read_revision(revision)?;
        Ok(OperationResult {
            key: key.to_string(),
            revision,
            old_revision: None,
            document: Some(document.to_json()),
        })
    }

    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Surfaces key, index, and journal errors; the collection is left
    /// unchanged on failure.
    pub fn insert(&self, input: &Value, options: &OperationOptions) -> Result<OperationResult> {
        self.check_loaded()?;

        let stored = match &options.recovery_marker {
            Some(replayed) => replayed.clone(),
            None => {
                let key = match extract_key(input)? {
                    Some(user_key) => {
                        self.key_generator.validate(&user_key, options.is_restore)?;
                        self.key_generator.track(&user_key);
                        user_key
                    },
                    None => self
                        .key_generator
                        .generate(self.clock.next().value())
                        .ok_or(Error::KeysExhausted)?,
                };
                let revision = self.next_revision(input, options);
                new_object_for_insert(
                    input,
                    key,
                    self.info.id_target(),
                    self.is_edge(),
                    revision,
                )?
            },
        };
        let revision = stored.revision();
        self.physical.set_last_revision(revision, false);
        let bytes = stored.to_bytes()?;
        let cache = self.physical.revision_cache();
        cache.insert(revision, DocumentPosition::Wal { data: bytes.clone().into() });

        let mut indexes = self.indexes.write()?;
        if let Err(e) = insert_all_indexes(&mut indexes, revision, &stored) {
            cache.remove(revision);
            return Err(e);
        }

        let append = match self.append_document(MarkerType::Document, &bytes, revision) {
            Ok(append) => append,
            Err(e) => {
                remove_all_indexes(&mut indexes, revision, &stored);
                cache.remove(revision);
                return Err(e);
            },
        };
        drop(indexes);
        self.finish_data_write(revision, &append, options)?;

        Ok(OperationResult {
            key: stored.key.clone(),
            revision,
            old_revision: None,
            document: Some(stored.to_json()),
        })
    }

    /// Partially updates a document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevMismatch`] on a failed revision check and
    /// [`Error::ShardKeysImmutable`] when a sharding attribute would
    /// change.
    pub fn update(&self, input: &Value, options: &OperationOptions) -> Result<OperationResult> {
        self.modify(input, options, |old, revision| {
            Ok(merged_for_update(old, input, options.merge_objects, options.keep_null, revision))
        })
    }

    /// Replaces a document wholesale.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Collection::update`].
    pub fn replace(&self, input: &Value, options: &OperationOptions) -> Result<OperationResult> {
        self.modify(input, options, |old, revision| {
            let replaced = new_object_for_replace(old, input, revision);
            if self.is_edge() && (replaced.from.is_none() || replaced.to.is_none()) {
                return Err(Error::KeyBad {
                    reason: "edge document requires _from and _to".to_string(),
                });
            }
            Ok(replaced)
        })
    }

    fn modify(
        &self,
        input: &Value,
        options: &OperationOptions,
        compose: impl Fn(&StoredDocument, RevisionId) -> Result<StoredDocument>,
    ) -> Result<OperationResult> {
        self.check_loaded()?;
        let key = extract_key(input)?
            .ok_or_else(|| Error::KeyBad { reason: "_key is required".to_string() })?;

        let mut indexes = self.indexes.write()?;
        let old_revision = indexes.primary.lookup(&key).ok_or(Error::DocumentNotFound)?;
        let old = self.read_revision(old_revision)?;
        self.check_revision(input, options, old_revision)?;

        let revision = self.next_revision(input, options);
        let stored = compose(&old, revision)?;
        self.check_shard_keys(&old, &stored)?;
        self.physical.set_last_revision(revision, false);

        let bytes = stored.to_bytes()?;
        let cache = self.physical.revision_cache();
        cache.insert(revision, DocumentPosition::Wal { data: bytes.clone().into() });

        if let Err(e) = swap_secondary_indexes(&mut indexes, old_revision, &old, revision, &stored) {
            cache.remove(revision);
            return Err(e);
        }
        indexes.primary.update_revision(&key, revision);

        let append = match self.append_document(MarkerType::Document, &bytes, revision) {
            Ok(append) => append,
            Err(e) => {
                indexes.primary.update_revision(&key, old_revision);
                // Reverse the secondary swap; rollback inserts cannot fail.
                let _ = swap_secondary_indexes(&mut indexes, revision, &stored, old_revision, &old);
                cache.remove(revision);
                return Err(e);
            },
        };
        drop(indexes);

        // The old revision is now dead in its datafile.
        if old_revision != revision {
            self.retire_revision(old_revision);
        }
        self.finish_data_write(revision, &append, options)?;

        Ok(OperationResult {
            key,
            revision,
            old_revision: Some(old_revision),
            document: Some(stored.to_json()),
        })
    }

    /// Removes a document by key (string input) or by `_key` attribute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DocumentNotFound`] for an unknown key and
    /// [`Error::RevMismatch`] on a failed revision check.
    pub fn remove(&self, input: &Value, options: &OperationOptions) -> Result<OperationResult> {
        self.check_loaded()?;
        let key = match input {
            Value::String(key) => key.clone(),
            _ => extract_key(input)?
                .ok_or_else(|| Error::KeyBad { reason: "_key is required".to_string() })?,
        };

        let mut indexes = self.indexes.write()?;
        let old_revision = indexes.primary.lookup(&key).ok_or(Error::DocumentNotFound)?;
        let old = self.read_revision(old_revision)?;
        if input.is_object() {
            self.check_revision(input, options, old_revision)?;
        }

        let removal_revision = self.clock.next_revision();
        self.physical.set_last_revision(removal_revision, false);
        let payload = new_object_for_remove(&old, removal_revision).to_bytes()?;
        let append = self.append_document(MarkerType::Remove, &payload, removal_revision)?;
        self.physical.statistics().increase_deletions(append.fid, 1);

        remove_all_indexes(&mut indexes, old_revision, &old);
        drop(indexes);
        self.retire_revision(old_revision);

        if options.wait_for_sync || self.info.wait_for_sync {
            self.physical.sync_active_journal()?;
        }

        Ok(OperationResult {
            key,
            revision: removal_revision,
            old_revision: Some(old_revision),
            document: None,
        })
    }

    /// Removes a document whose previous image the caller already holds.
    ///
    /// Fast path for replication and recovery driving: skips the key
    /// lookup and the revision check.
    ///
    /// # Errors
    ///
    /// Surfaces journal append errors; index state is reverted on failure.
    pub fn remove_fast_path(
        &self,
        old: &StoredDocument,
        options: &OperationOptions,
    ) -> Result<OperationResult> {
        self.check_loaded()?;
        let old_revision = old.revision();
        let removal_revision = self.clock.next_revision();
        self.physical.set_last_revision(removal_revision, false);
        let payload = new_object_for_remove(old, removal_revision).to_bytes()?;

        let mut indexes = self.indexes.write()?;
        let append = self.append_document(MarkerType::Remove, &payload, removal_revision)?;
        self.physical.statistics().increase_deletions(append.fid, 1);
        remove_all_indexes(&mut indexes, old_revision, old);
        drop(indexes);
        self.retire_revision(old_revision);

        if options.wait_for_sync || self.info.wait_for_sync {
            self.physical.sync_active_journal()?;
        }
        Ok(OperationResult {
            key: old.key.clone(),
            revision: removal_revision,
            old_revision: Some(old_revision),
            document: None,
        })
    }

    fn next_revision(&self, input: &Value, options: &OperationOptions) -> RevisionId {
        if options.is_restore {
            if let Some(incoming) = extract_expected_rev(input) {
                self.clock.observe(incoming.value());
                return incoming;
            }
        }
        self.clock.next_revision()
    }

    fn check_revision(
        &self,
        input: &Value,
        options: &OperationOptions,
        found: RevisionId,
    ) -> Result<()> {
        if options.ignore_revs || options.is_restore {
            return Ok(());
        }
        if let Some(expected) = extract_expected_rev(input) {
            if expected != found {
                return Err(Error::RevMismatch { expected, found });
            }
        }
        Ok(())
    }

    fn check_shard_keys(&self, old: &StoredDocument, new: &StoredDocument) -> Result<()> {
        for shard_key in &self.info.shard_keys {
            if old.shard_key_value(shard_key) != new.shard_key_value(shard_key) {
                return Err(Error::ShardKeysImmutable { attribute: shard_key.clone() });
            }
        }
        Ok(())
    }

    fn append_document(
        &self,
        marker_type: MarkerType,
        payload: &[u8],
        revision: RevisionId,
    ) -> Result<AppendResult> {
        self.physical.append_marker(marker_type, Tick::new(revision.value()), payload)
    }

    /// After a successful append: point the cache at the file position,
    /// account the live document, honor waitForSync.
    fn finish_data_write(
        &self,
        revision: RevisionId,
        append: &AppendResult,
        options: &OperationOptions,
    ) -> Result<()> {
        self.physical.revision_cache().update_conditional(
            revision,
            DocumentPosition::File {
                fid: append.fid,
                offset: append.payload_offset,
                len: append.payload_len,
            },
        );
        self.physical.statistics().increase_alive(
            append.fid,
            1,
            align8((MARKER_HEADER_SIZE as u32 + append.payload_len) as u64),
        );
        if options.wait_for_sync || self.info.wait_for_sync {
            self.physical.sync_active_journal()?;
        }
        Ok(())
    }

    /// Drops a superseded revision from the cache, moving its bytes to the
    /// dead account of its datafile.
    fn retire_revision(&self, revision: RevisionId) {
        if let Some(position) = self.physical.revision_cache().fetch_and_remove(revision) {
            if !position.is_in_wal() {
                self.physical.statistics().increase_dead(
                    position.fid(),
                    1,
                    align8((MARKER_HEADER_SIZE + position.len()) as u64),
                );
            }
        }
    }
}

/// Inserts into the primary index, then all secondaries; on secondary
/// failure the completed inserts are reverted in reverse order.
///
/// A unique-constraint violation is preferred over less specific errors.
fn insert_all_indexes(
    indexes: &mut IndexSet,
    revision: RevisionId,
    document: &StoredDocument,
) -> Result<()> {
    indexes.primary.insert_key(&document.key, revision)?;
    let mut failure: Option<Error> = None;
    let mut completed = 0usize;
    for secondary in indexes.secondaries.iter_mut() {
        match secondary.insert(revision, document, false) {
            Ok(()) => completed += 1,
            Err(e) => {
                let prefer = matches!(e, Error::UniqueConstraintViolated { .. });
                if failure.is_none() || prefer {
                    failure = Some(e);
                }
                break;
            },
        }
    }
    if let Some(e) = failure {
        for secondary in indexes.secondaries.iter_mut().take(completed).rev() {
            let _ = secondary.remove(revision, document, true);
        }
        indexes.primary.remove_key(&document.key);
        return Err(e);
    }
    Ok(())
}

/// Removes a document from all secondaries, then the primary index.
fn remove_all_indexes(indexes: &mut IndexSet, revision: RevisionId, document: &StoredDocument) {
    for secondary in indexes.secondaries.iter_mut().rev() {
        let _ = secondary.remove(revision, document, false);
    }
    indexes.primary.remove_key(&document.key);
}

/// Swaps the secondary-index entries of a document from the old to the new
/// revision, rolling back on failure.
fn swap_secondary_indexes(
    indexes: &mut IndexSet,
    old_revision: RevisionId,
    old: &StoredDocument,
    new_revision: RevisionId,
    new: &StoredDocument,
) -> Result<()> {
    for secondary in indexes.secondaries.iter_mut() {
        let _ = secondary.remove(old_revision, old, false);
    }
    let mut failure: Option<Error> = None;
    let mut completed = 0usize;
    for secondary in indexes.secondaries.iter_mut() {
        match secondary.insert(new_revision, new, false) {
            Ok(()) => completed += 1,
            Err(e) => {
                failure = Some(e);
                break;
            },
        }
    }
    if let Some(e) = failure {
        for secondary in indexes.secondaries.iter_mut().take(completed).rev() {
            let _ = secondary.remove(new_revision, new, true);
        }
        for secondary in indexes.secondaries.iter_mut() {
            let _ = secondary.insert(old_revision, old, true);
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::indexes::HashIndex;
    use crate::key_generator::TraditionalKeyGenerator;
    use crate::physical::AppendStore;

    fn collection_with(
        shard_keys: Vec<&str>,
        secondaries: Vec<Box<dyn SecondaryIndex>>,
    ) -> Collection {
        let info = CollectionInfo {
            cid: CollectionId::new(1),
            plan_id: 0,
            name: "test".to_string(),
            collection_type: CollectionType::Document,
            shard_keys: shard_keys.into_iter().map(str::to_string).collect(),
            replication_factor: 1,
            number_of_shards: 1,
            wait_for_sync: false,
            is_volatile: true,
            is_system: false,
            journal_size: 4 * 1024 * 1024,
        };
        let physical = Box::new(AppendStore::new(info.cid, None, info.journal_size));
        Collection::new(
            info,
            physical,
            Arc::new(HybridLogicalClock::new()),
            Box::new(TraditionalKeyGenerator::new(true)),
            secondaries,
            Arc::new(DeadlockDetector::new()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn collection() -> Collection {
        collection_with(vec!["_key"], Vec::new())
    }

    #[test]
    fn test_insert_and_read() {
        let collection = collection();
        let result =
            collection.insert(&json!({"_key": "a", "x": 1}), &OperationOptions::default()).unwrap();
        assert_eq!(result.key, "a");
        let read = collection.read("a").unwrap();
        let document = read.document.unwrap();
        assert_eq!(document["x"], json!(1));
        assert_eq!(document["_key"], json!("a"));
    }

    #[test]
    fn test_insert_generates_key_when_missing() {
        let collection = collection();
        let result = collection.insert(&json!({"x": 1}), &OperationOptions::default()).unwrap();
        assert!(!result.key.is_empty());
        assert!(collection.read(&result.key).is_ok());
    }

    #[test]
    fn test_insert_duplicate_key_rejected_and_clean() {
        let collection = collection();
        collection.insert(&json!({"_key": "a"}), &OperationOptions::default()).unwrap();
        let err =
            collection.insert(&json!({"_key": "a"}), &OperationOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
        assert_eq!(collection.document_count().unwrap(), 1);
    }

    #[test]
    fn test_update_bumps_revision_and_retires_old() {
        let collection = collection();
        let first =
            collection.insert(&json!({"_key": "a", "x": 1}), &OperationOptions::default()).unwrap();
        let second = collection
            .update(&json!({"_key": "a", "x": 2}), &OperationOptions::update_defaults())
            .unwrap();
        assert!(second.revision > first.revision);
        assert_eq!(second.old_revision, Some(first.revision));
        let cache = collection.physical().revision_cache();
        assert!(cache.contains(second.revision));
        assert!(!cache.contains(first.revision));
        let read = collection.read("a").unwrap();
        assert_eq!(read.document.unwrap()["x"], json!(2));
    }

    #[test]
    fn test_revision_check() {
        let collection = collection();
        let first =
            collection.insert(&json!({"_key": "a", "x": 1}), &OperationOptions::default()).unwrap();
        let stale = json!({"_key": "a", "_rev": "1", "x": 9});
        let err = collection.update(&stale, &OperationOptions::update_defaults()).unwrap_err();
        assert!(matches!(err, Error::RevMismatch { .. }));

        let fresh = json!({"_key": "a", "_rev": first.revision.value().to_string(), "x": 9});
        collection.update(&fresh, &OperationOptions::update_defaults()).unwrap();

        let ignore =
            OperationOptions { ignore_revs: true, ..OperationOptions::update_defaults() };
        collection.update(&stale, &ignore).unwrap();
    }

    #[test]
    fn test_shard_key_change_rejected() {
        let collection = collection_with(vec!["country"], Vec::new());
        collection
            .insert(&json!({"_key": "a", "country": "de"}), &OperationOptions::default())
            .unwrap();
        let err = collection
            .update(&json!({"_key": "a", "country": "fr"}), &OperationOptions::update_defaults())
            .unwrap_err();
        assert!(matches!(err, Error::ShardKeysImmutable { .. }));
        // Collection unchanged.
        let read = collection.read("a").unwrap();
        assert_eq!(read.document.unwrap()["country"], json!("de"));
    }

    #[test]
    fn test_replace_drops_unmentioned_attributes() {
        let collection = collection();
        collection
            .insert(&json!({"_key": "a", "x": 1, "y": 2}), &OperationOptions::default())
            .unwrap();
        collection.replace(&json!({"_key": "a", "z": 3}), &OperationOptions::default()).unwrap();
        let document = collection.read("a").unwrap().document.unwrap();
        assert!(document.get("x").is_none());
        assert_eq!(document["z"], json!(3));
    }

    #[test]
    fn test_remove() {
        let collection = collection();
        collection.insert(&json!({"_key": "a"}), &OperationOptions::default()).unwrap();
        let result = collection.remove(&json!("a"), &OperationOptions::default()).unwrap();
        assert!(result.old_revision.is_some());
        assert!(matches!(collection.read("a"), Err(Error::DocumentNotFound)));
        assert_eq!(collection.document_count().unwrap(), 0);
        assert!(collection.physical().revision_cache().is_empty());
    }

    #[test]
    fn test_remove_fast_path() {
        let collection = collection();
        let inserted =
            collection.insert(&json!({"_key": "a", "x": 1}), &OperationOptions::default()).unwrap();
        let old = collection.read_revision(inserted.revision).unwrap();
        let result = collection.remove_fast_path(&old, &OperationOptions::default()).unwrap();
        assert_eq!(result.old_revision, Some(inserted.revision));
        assert!(matches!(collection.read("a"), Err(Error::DocumentNotFound)));
    }

    #[test]
    fn test_remove_unknown_key() {
        let collection = collection();
        let err = collection.remove(&json!("nope"), &OperationOptions::default()).unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound));
    }

    #[test]
    fn test_unique_secondary_rollback_keeps_collection_consistent() {
        let secondaries: Vec<Box<dyn SecondaryIndex>> =
            vec![Box::new(HashIndex::new("byEmail", vec!["email".to_string()], true))];
        let collection = collection_with(vec!["_key"], secondaries);
        collection
            .insert(&json!({"_key": "a", "email": "x@y"}), &OperationOptions::default())
            .unwrap();
        let err = collection
            .insert(&json!({"_key": "b", "email": "x@y"}), &OperationOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
        assert_eq!(collection.document_count().unwrap(), 1);
        assert!(matches!(collection.read("b"), Err(Error::DocumentNotFound)));
        // The failed insert's revision must not linger in the cache.
        assert_eq!(collection.physical().revision_cache().len(), 1);
    }

    #[test]
    fn test_cache_invariant_after_update() {
        let collection = collection();
        collection.insert(&json!({"_key": "a", "x": 1}), &OperationOptions::default()).unwrap();
        let updated = collection
            .update(&json!({"_key": "a", "x": 2}), &OperationOptions::update_defaults())
            .unwrap();
        // cache[r2] dereferences to a document whose _rev == r2 and _key == a.
        let stored = collection.read_revision(updated.revision).unwrap();
        assert_eq!(stored.rev, updated.revision.value());
        assert_eq!(stored.key, "a");
    }

    #[test]
    fn test_restore_ingests_incoming_revision() {
        let collection = collection();
        let options = OperationOptions { is_restore: true, ..OperationOptions::default() };
        let incoming_rev: u64 = 1 << 60;
        collection
            .insert(&json!({"_key": "a", "_rev": incoming_rev.to_string()}), &options)
            .unwrap();
        let read = collection.read("a").unwrap();
        assert_eq!(read.revision, RevisionId::new(incoming_rev));
        // The clock must have advanced past the ingested revision.
        let next =
            collection.insert(&json!({"_key": "b"}), &OperationOptions::default()).unwrap();
        assert!(next.revision.value() > incoming_rev);
    }

    #[test]
    fn test_edge_collection_validations() {
        let mut info = CollectionInfo {
            cid: CollectionId::new(2),
            plan_id: 0,
            name: "edges".to_string(),
            collection_type: CollectionType::Edge,
            shard_keys: vec!["_key".to_string()],
            replication_factor: 1,
            number_of_shards: 1,
            wait_for_sync: false,
            is_volatile: true,
            is_system: false,
            journal_size: 4 * 1024 * 1024,
        };
        info.validate().unwrap();
        info.wait_for_sync = true;
        assert!(info.validate().is_err(), "volatile + waitForSync must be rejected");
    }

    #[test]
    fn test_recovery_marker_replays_verbatim() {
        let collection = collection();
        let stored = document::new_object_for_insert(
            &json!({"x": 42}),
            "replayed".to_string(),
            1,
            false,
            RevisionId::new(777),
        )
        .unwrap();
        let options =
            OperationOptions { recovery_marker: Some(stored), ..OperationOptions::default() };
        let result = collection.insert(&json!({}), &options).unwrap();
        assert_eq!(result.key, "replayed");
        assert_eq!(result.revision, RevisionId::new(777));
    }

    #[test]
    fn test_deleted_collection_rejects_operations() {
        let collection = collection();
        collection.mark_deleted();
        let err = collection.insert(&json!({"_key": "a"}), &OperationOptions::default());
        assert!(matches!(err, Err(Error::CollectionNotFound)));
    }
}
