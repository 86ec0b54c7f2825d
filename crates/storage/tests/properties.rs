//! Property tests for the marker format and the write pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use arbor_storage::{
    AppendStore, Collection, CollectionInfo, CollectionType, DeadlockDetector, MarkerType,
    OperationOptions, TraditionalKeyGenerator, marker,
};
use arbor_test_utils::strategies;
use arbor_types::{CollectionId, HybridLogicalClock, Tick};

fn volatile_collection() -> Collection {
    let info = CollectionInfo {
        cid: CollectionId::new(21),
        plan_id: 0,
        name: "props".to_string(),
        collection_type: CollectionType::Document,
        shard_keys: vec!["_key".to_string()],
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
        Vec::new(),
        Arc::new(DeadlockDetector::new()),
        Duration::from_secs(5),
    )
    .unwrap()
}

proptest! {
    /// Markers decode to what was encoded, byte-for-byte, with a valid
    /// checksum, for arbitrary payloads and ticks.
    #[test]
    fn marker_roundtrip(payload in strategies::arb_payload(), tick in 1u64..u64::MAX) {
        let buf = marker::encode_marker(MarkerType::Document, Tick::new(tick), &payload);
        prop_assert_eq!(buf.len() % 8, 0);
        let header = marker::decode_header(&buf).unwrap();
        prop_assert_eq!(header.tick.value(), tick);
        prop_assert_eq!(header.payload_len(), payload.len());
        prop_assert!(marker::verify_crc(&buf, &header));
        prop_assert_eq!(
            &buf[marker::MARKER_HEADER_SIZE..marker::MARKER_HEADER_SIZE + payload.len()],
            payload.as_slice()
        );
    }

    /// Flipping any byte of an encoded marker breaks the checksum (or the
    /// header decode).
    #[test]
    fn marker_corruption_detected(
        payload in strategies::arb_payload(),
        flip in 0usize..32,
    ) {
        let buf = marker::encode_marker(MarkerType::Remove, Tick::new(99), &payload);
        // Only bytes covered by the checksum; padding is not protected.
        let position = flip % (marker::MARKER_HEADER_SIZE + payload.len());
        let mut corrupted = buf.clone();
        corrupted[position] ^= 0x01;
        let intact = match marker::decode_header(&corrupted) {
            Ok(header) => marker::verify_crc(&corrupted, &header)
                && header.size == (marker::MARKER_HEADER_SIZE + payload.len()) as u32,
            Err(_) => false,
        };
        prop_assert!(!intact, "corruption at byte {position} went unnoticed");
    }

    /// After any insert the cache invariant holds: the primary's revision
    /// dereferences to a document with the same key and revision.
    #[test]
    fn insert_maintains_cache_invariant(
        key in strategies::arb_document_key(),
        body in strategies::arb_document_body(),
    ) {
        let collection = volatile_collection();
        let mut input = body.clone();
        input.as_object_mut().unwrap().insert("_key".to_string(), json!(key.clone()));
        let result = collection.insert(&input, &OperationOptions::default()).unwrap();
        let stored = collection.read_revision(result.revision).unwrap();
        prop_assert_eq!(stored.revision(), result.revision);
        prop_assert_eq!(stored.key, key);
    }
}
