//! Proptest strategies for arbor domain values.
//!
//! Reusable generators shared across crates. Strategies produce well-formed
//! values while exploring edge cases through random variation.

use proptest::prelude::*;
use serde_json::{Value, json};

/// Generates a document key of 1-16 characters matching `[a-z][a-z0-9]*`.
pub fn arb_document_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,15}"
}

/// Generates a server id like `PRMR-0007` or `CRDN-0042`.
pub fn arb_server_id() -> impl Strategy<Value = String> {
    (prop::sample::select(vec!["PRMR", "CRDN"]), 0u32..10_000)
        .prop_map(|(role, n)| format!("{role}-{n:04}"))
}

/// Generates a flat JSON document body with 0-6 user attributes.
pub fn arb_document_body() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,8}", arb_attr_value(), 0..6).prop_map(|attrs| {
        let mut map = serde_json::Map::new();
        for (k, v) in attrs {
            map.insert(k, v);
        }
        Value::Object(map)
    })
}

/// Generates a scalar or shallow JSON attribute value.
pub fn arb_attr_value() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    prop_oneof![
        scalar.clone(),
        prop::collection::vec(scalar.clone(), 0..4).prop_map(Value::from),
        prop::collection::btree_map("[a-z]{1,4}", scalar, 0..3)
            .prop_map(|m| json!(m)),
    ]
}

/// Generates marker payload bytes of 0-512 bytes.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Generates a heartbeat trace: a sequence of (beat advanced?, seconds
/// elapsed) steps for health-transition property tests.
pub fn arb_heartbeat_trace() -> impl Strategy<Value = Vec<(bool, u64)>> {
    prop::collection::vec((any::<bool>(), 0u64..20), 1..40)
}
