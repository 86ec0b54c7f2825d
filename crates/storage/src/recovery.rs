//! Startup recovery: rebuild indexes and cache from datafile markers.
//!
//! Drives every datafile, journal and compactor of a collection in fid
//! order through a single dispatching callback. After recovery the primary
//! index holds exactly the live documents, every cached revision
//! dereferences to a valid position, and the per-file statistics reflect
//! alive/dead/deletion counts.

use std::collections::HashMap;

use arbor_types::{FileId, RevisionId};

use crate::collection::Collection;
use crate::document::StoredDocument;
use crate::error::Result;
use crate::marker::{MARKER_HEADER_SIZE, MarkerHeader, MarkerType, align8};
use crate::physical::StorageBackend;
use crate::revision_cache::DocumentPosition;
use crate::stats::StatsContainer;

/// Counters produced by one recovery run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Document markers replayed.
    pub documents: u64,
    /// Remove markers replayed.
    pub deletions: u64,
}

/// Mutable state threaded through the marker callback.
#[derive(Default)]
struct OpenIteratorState {
    stats: HashMap<FileId, StatsContainer>,
    report: RecoveryReport,
}

impl OpenIteratorState {
    fn container(&mut self, fid: FileId) -> &mut StatsContainer {
        self.stats.entry(fid).or_default()
    }
}

/// Replays all markers of the collection's files into its indexes.
///
/// # Errors
///
/// Surfaces read errors, codec errors and index inconsistencies; the
/// collection should be discarded when recovery fails.
pub fn iterate_markers_on_load(collection: &Collection) -> Result<RecoveryReport> {
    let mut state = OpenIteratorState::default();
    let mut indexes = collection.indexes().write()?;

    collection.physical().iterate_on_load(&mut |fid, header, payload, payload_offset| {
        match header.marker_type {
            MarkerType::Document => handle_document_marker(
                collection,
                &mut indexes.primary,
                &mut state,
                fid,
                header,
                payload,
                payload_offset,
            ),
            MarkerType::Remove => {
                handle_remove_marker(collection, &mut indexes.primary, &mut state, fid, payload)
            },
            MarkerType::DatafileHeader | MarkerType::ColHeader => {
                state.container(fid);
                Ok(())
            },
            MarkerType::Blank | MarkerType::Footer | MarkerType::Prologue => Ok(()),
        }
    })?;

    for (fid, container) in state.stats {
        collection.physical().statistics().create_with(fid, container);
    }

    tracing::trace!(
        documents = state.report.documents,
        deletions = state.report.deletions,
        collection = %collection.info().name,
        "replayed markers on load"
    );
    Ok(state.report)
}

fn handle_document_marker(
    collection: &Collection,
    primary: &mut crate::indexes::PrimaryIndex,
    state: &mut OpenIteratorState,
    fid: FileId,
    header: &MarkerHeader,
    payload: &[u8],
    payload_offset: u64,
) -> Result<()> {
    let document = StoredDocument::from_bytes(payload)?;
    let revision = document.revision();
    collection.physical().set_last_revision(revision, false);
    collection.clock().observe(revision.value());
    collection.key_generator().track(&document.key);
    state.report.documents += 1;

    let cache = collection.physical().revision_cache();
    let position = DocumentPosition::File {
        fid,
        offset: payload_offset,
        len: payload.len() as u32,
    };
    let marker_size = header.aligned_size();

    match primary.lookup(&document.key) {
        None => {
            cache.insert(revision, position);
            primary.insert_key(&document.key, revision)?;
            let container = state.container(fid);
            container.number_alive += 1;
            container.size_alive += marker_size;
        },
        Some(old_revision) => {
            // Update: the key slot stays, the revision moves.
            primary.update_revision(&document.key, revision);
            let old_position = cache.fetch_and_remove(old_revision);
            cache.insert(revision, position);
            if let Some(old_position) = old_position {
                let old_size = align8((MARKER_HEADER_SIZE + old_position.len()) as u64);
                let old_container = state.container(old_position.fid());
                old_container.number_alive = old_container.number_alive.saturating_sub(1);
                old_container.size_alive = old_container.size_alive.saturating_sub(old_size);
                old_container.number_dead += 1;
                old_container.size_dead += old_size;
            }
            let container = state.container(fid);
            container.number_alive += 1;
            container.size_alive += marker_size;
        },
    }
    Ok(())
}

fn handle_remove_marker(
    collection: &Collection,
    primary: &mut crate::indexes::PrimaryIndex,
    state: &mut OpenIteratorState,
    fid: FileId,
    payload: &[u8],
) -> Result<()> {
    let removal = StoredDocument::from_bytes(payload)?;
    let revision: RevisionId = removal.revision();
    collection.physical().set_last_revision(revision, false);
    collection.clock().observe(revision.value());
    collection.key_generator().track(&removal.key);
    state.report.deletions += 1;

    let cache = collection.physical().revision_cache();
    match primary.remove_key(&removal.key) {
        None => {
            // The matching insert was never replayed (partial file).
            state.container(fid).number_deletions += 1;
        },
        Some(old_revision) => {
            if let Some(old_position) = cache.fetch_and_remove(old_revision) {
                let old_size = align8((MARKER_HEADER_SIZE + old_position.len()) as u64);
                let old_container = state.container(old_position.fid());
                old_container.number_alive = old_container.number_alive.saturating_sub(1);
                old_container.size_alive = old_container.size_alive.saturating_sub(old_size);
                old_container.number_dead += 1;
                old_container.size_dead += old_size;
            }
            state.container(fid).number_deletions += 1;
        },
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::collection::{CollectionInfo, CollectionType, OperationOptions};
    use crate::key_generator::TraditionalKeyGenerator;
    use crate::lock::DeadlockDetector;
    use crate::physical::AppendStore;
    use arbor_types::{CollectionId, HybridLogicalClock};

    fn info() -> CollectionInfo {
        CollectionInfo {
            cid: CollectionId::new(3),
            plan_id: 0,
            name: "recovered".to_string(),
            collection_type: CollectionType::Document,
            shard_keys: vec!["_key".to_string()],
            replication_factor: 1,
            number_of_shards: 1,
            wait_for_sync: false,
            is_volatile: false,
            is_system: false,
            journal_size: 1024 * 1024,
        }
    }

    fn collection_over(physical: AppendStore) -> Collection {
        Collection::new(
            info(),
            Box::new(physical),
            Arc::new(HybridLogicalClock::new()),
            Box::new(TraditionalKeyGenerator::new(true)),
            Vec::new(),
            Arc::new(DeadlockDetector::new()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn reopen(dir: &std::path::Path) -> Collection {
        let physical = AppendStore::open(CollectionId::new(3), dir.to_path_buf(), 1024 * 1024)
            .unwrap();
        collection_over(physical)
    }

    #[test]
    fn test_recovery_reproduces_live_documents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let collection = collection_over(AppendStore::new(
                CollectionId::new(3),
                Some(dir.path().to_path_buf()),
                1024 * 1024,
            ));
            let options = OperationOptions::default();
            collection.insert(&json!({"_key": "a", "x": 1}), &options).unwrap();
            collection.insert(&json!({"_key": "b", "x": 2}), &options).unwrap();
            collection
                .update(&json!({"_key": "a", "x": 10}), &OperationOptions::update_defaults())
                .unwrap();
            collection.remove(&json!("b"), &options).unwrap();
            collection.physical().sync_active_journal().unwrap();
        }

        let recovered = reopen(dir.path());
        let report = iterate_markers_on_load(&recovered).unwrap();
        assert_eq!(report.documents, 3);
        assert_eq!(report.deletions, 1);

        assert_eq!(recovered.document_count().unwrap(), 1);
        let read = recovered.read("a").unwrap();
        assert_eq!(read.document.unwrap()["x"], json!(10));
        assert!(matches!(recovered.read("b"), Err(crate::error::Error::DocumentNotFound)));
    }

    #[test]
    fn test_recovery_cache_matches_primary() {
        let dir = tempfile::tempdir().unwrap();
        {
            let collection = collection_over(AppendStore::new(
                CollectionId::new(3),
                Some(dir.path().to_path_buf()),
                1024 * 1024,
            ));
            for i in 0..20 {
                collection
                    .insert(&json!({"_key": format!("k{i}"), "i": i}), &OperationOptions::default())
                    .unwrap();
            }
            collection.physical().sync_active_journal().unwrap();
        }

        let recovered = reopen(dir.path());
        iterate_markers_on_load(&recovered).unwrap();
        let indexes = recovered.indexes().read().unwrap();
        assert_eq!(indexes.primary.len(), recovered.physical().revision_cache().len());
        for (key, revision) in indexes.primary.iter() {
            let stored = recovered.read_revision(revision).unwrap();
            assert_eq!(stored.key, key);
            assert_eq!(stored.revision(), revision);
        }
    }

    #[test]
    fn test_recovery_counts_unmatched_remove() {
        // A remove whose insert lives in a file that was lost: the remove
        // still bumps the deletion statistics.
        let dir = tempfile::tempdir().unwrap();
        {
            let collection = collection_over(AppendStore::new(
                CollectionId::new(3),
                Some(dir.path().to_path_buf()),
                1024 * 1024,
            ));
            collection.insert(&json!({"_key": "gone"}), &OperationOptions::default()).unwrap();
            collection.remove(&json!("gone"), &OperationOptions::default()).unwrap();
            collection.physical().sync_active_journal().unwrap();
        }

        let recovered = reopen(dir.path());
        let report = iterate_markers_on_load(&recovered).unwrap();
        assert_eq!(report.deletions, 1);
        assert_eq!(recovered.document_count().unwrap(), 0);
        let total = recovered.physical().statistics().all();
        assert_eq!(total.number_deletions, 1);
        assert_eq!(total.number_alive, 0);
    }

    #[test]
    fn test_recovery_advances_clock_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let highest;
        {
            let collection = collection_over(AppendStore::new(
                CollectionId::new(3),
                Some(dir.path().to_path_buf()),
                1024 * 1024,
            ));
            let result =
                collection.insert(&json!({"_key": "42"}), &OperationOptions::default()).unwrap();
            highest = result.revision;
            collection.physical().sync_active_journal().unwrap();
        }

        let recovered = reopen(dir.path());
        iterate_markers_on_load(&recovered).unwrap();
        assert_eq!(recovered.physical().last_revision(), highest);
        assert!(recovered.clock().current() >= highest.value());
        assert!(recovered.key_generator().generate(1).unwrap().parse::<u64>().unwrap() > 42);
    }
}
