//! Stored document model.
//!
//! Documents carry their system attributes first and in fixed order:
//! `_key`, `_id`, `_from`, `_to` (edges only), `_rev`. User attributes
//! follow in document order. The `_id` attribute is stored in a compact
//! 9-byte custom form: a type tag byte followed by the little-endian u64 of
//! the owning collection (the plan id on data nodes, the local cid
//! elsewhere).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbor_types::{RevisionId, decode, encode, validation};

use crate::error::{Error, Result};

/// Type tag of the custom `_id` form.
pub const ID_CUSTOM_TAG: u8 = 0xf3;

/// System attribute names, in their fixed storage order.
pub const SYSTEM_ATTRIBUTES: [&str; 5] = ["_key", "_id", "_from", "_to", "_rev"];

/// The 9-byte custom `_id` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentId([u8; 9]);

impl DocumentId {
    /// Builds the custom form for a collection target id.
    #[must_use]
    pub fn new(target: u64) -> Self {
        let mut bytes = [0u8; 9];
        bytes[0] = ID_CUSTOM_TAG;
        bytes[1..9].copy_from_slice(&target.to_le_bytes());
        Self(bytes)
    }

    /// The raw 9 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 9] {
        &self.0
    }

    /// Extracts the collection target id.
    #[must_use]
    pub fn target(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[1..9]);
        u64::from_le_bytes(raw)
    }
}

/// A user attribute value.
///
/// Self-describing so that document bodies survive the binary codec; built
/// from and convertible back to JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer outside the i64 range.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// String.
    String(String),
    /// Array of values.
    Array(Vec<AttrValue>),
    /// Object with attribute order preserved.
    Object(Vec<(String, AttrValue)>),
}

impl From<&Value> for AttrValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => AttrValue::Null,
            Value::Bool(b) => AttrValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    AttrValue::UInt(u)
                } else {
                    AttrValue::Float(n.as_f64().unwrap_or(0.0))
                }
            },
            Value::String(s) => AttrValue::String(s.clone()),
            Value::Array(items) => AttrValue::Array(items.iter().map(AttrValue::from).collect()),
            Value::Object(map) => {
                AttrValue::Object(map.iter().map(|(k, v)| (k.clone(), AttrValue::from(v))).collect())
            },
        }
    }
}

impl From<&AttrValue> for Value {
    fn from(value: &AttrValue) -> Self {
        match value {
            AttrValue::Null => Value::Null,
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Int(i) => Value::from(*i),
            AttrValue::UInt(u) => Value::from(*u),
            AttrValue::Float(f) => {
                serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
            },
            AttrValue::String(s) => Value::String(s.clone()),
            AttrValue::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            AttrValue::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), Value::from(v));
                }
                Value::Object(map)
            },
        }
    }
}

/// One stored document revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// `_key`
    pub key: String,
    /// `_id` in the 9-byte custom form.
    pub id: DocumentId,
    /// `_from` for edge documents.
    pub from: Option<String>,
    /// `_to` for edge documents.
    pub to: Option<String>,
    /// `_rev`
    pub rev: u64,
    /// User attributes in document order; system attributes never appear
    /// here.
    pub attrs: Vec<(String, AttrValue)>,
}

impl StoredDocument {
    /// The revision id.
    #[must_use]
    pub fn revision(&self) -> RevisionId {
        RevisionId::new(self.rev)
    }

    /// Looks up a user attribute by name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Resolves the value a shard key has in this document.
    ///
    /// `_key` resolves to the document key; other system attributes never
    /// participate in sharding.
    #[must_use]
    pub fn shard_key_value(&self, shard_key: &str) -> AttrValue {
        if shard_key == "_key" {
            return AttrValue::String(self.key.clone());
        }
        self.attr(shard_key).cloned().unwrap_or(AttrValue::Null)
    }

    /// Encodes the document body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(encode(self)?)
    }

    /// Decodes a document body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the bytes are not a valid document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(decode(bytes)?)
    }

    /// Renders the full document as JSON (read results).
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("_key".to_string(), Value::String(self.key.clone()));
        map.insert("_id".to_string(), Value::from(self.id.target()));
        if let Some(from) = &self.from {
            map.insert("_from".to_string(), Value::String(from.clone()));
        }
        if let Some(to) = &self.to {
            map.insert("_to".to_string(), Value::String(to.clone()));
        }
        map.insert("_rev".to_string(), Value::String(self.rev.to_string()));
        for (k, v) in &self.attrs {
            map.insert(k.clone(), Value::from(v));
        }
        Value::Object(map)
    }
}

/// Extracts the user attributes of an input object, skipping system ones.
fn user_attributes(input: &Value) -> Vec<(String, AttrValue)> {
    input
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| !SYSTEM_ATTRIBUTES.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), AttrValue::from(v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Builds the stored form of a new document.
///
/// `id_target` is the plan id on data nodes and the cid elsewhere. Edge
/// collections must provide `from` and `to`.
///
/// # Errors
///
/// Returns [`Error::KeyBad`] when `from`/`to` are missing on an edge
/// document.
pub fn new_object_for_insert(
    input: &Value,
    key: String,
    id_target: u64,
    is_edge: bool,
    rev: RevisionId,
) -> Result<StoredDocument> {
    let (from, to) = if is_edge {
        let from = input.get("_from").and_then(Value::as_str).map(str::to_string);
        let to = input.get("_to").and_then(Value::as_str).map(str::to_string);
        if from.is_none() || to.is_none() {
            return Err(Error::KeyBad {
                reason: "edge document requires _from and _to".to_string(),
            });
        }
        (from, to)
    } else {
        (None, None)
    };
    Ok(StoredDocument {
        key,
        id: DocumentId::new(id_target),
        from,
        to,
        rev: rev.value(),
        attrs: user_attributes(input),
    })
}

/// Builds the merged document for an update.
///
/// Starts from the old document's attributes. Patch attributes replace or
/// extend them; `merge_objects` descends into objects present on both
/// sides; `keep_null = false` turns explicit nulls into attribute removal.
#[must_use]
pub fn merged_for_update(
    old: &StoredDocument,
    patch: &Value,
    merge_objects: bool,
    keep_null: bool,
    rev: RevisionId,
) -> StoredDocument {
    let mut attrs = old.attrs.clone();
    for (name, value) in patch.as_object().into_iter().flatten() {
        if SYSTEM_ATTRIBUTES.contains(&name.as_str()) {
            continue;
        }
        if value.is_null() && !keep_null {
            attrs.retain(|(k, _)| k != name);
            continue;
        }
        let incoming = AttrValue::from(value);
        match attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, existing)) => {
                if merge_objects {
                    if let (AttrValue::Object(old_entries), AttrValue::Object(new_entries)) =
                        (&*existing, &incoming)
                    {
                        *existing =
                            AttrValue::Object(merge_objects_rec(old_entries, new_entries, keep_null));
                        continue;
                    }
                }
                *existing = incoming;
            },
            None => attrs.push((name.clone(), incoming)),
        }
    }
    StoredDocument {
        key: old.key.clone(),
        id: old.id,
        from: old.from.clone(),
        to: old.to.clone(),
        rev: rev.value(),
        attrs,
    }
}

fn merge_objects_rec(
    old: &[(String, AttrValue)],
    new: &[(String, AttrValue)],
    keep_null: bool,
) -> Vec<(String, AttrValue)> {
    let mut merged = old.to_vec();
    for (name, value) in new {
        if matches!(value, AttrValue::Null) && !keep_null {
            merged.retain(|(k, _)| k != name);
            continue;
        }
        match merged.iter_mut().find(|(k, _)| k == name) {
            Some((_, existing)) => {
                if let (AttrValue::Object(old_inner), AttrValue::Object(new_inner)) =
                    (&*existing, value)
                {
                    *existing = AttrValue::Object(merge_objects_rec(old_inner, new_inner, keep_null));
                } else {
                    *existing = value.clone();
                }
            },
            None => merged.push((name.clone(), value.clone())),
        }
    }
    merged
}

/// Builds the stored form of a replace: the new body wholesale, the old
/// document's identity.
#[must_use]
pub fn new_object_for_replace(
    old: &StoredDocument,
    input: &Value,
    rev: RevisionId,
) -> StoredDocument {
    let from = input.get("_from").and_then(Value::as_str).map(str::to_string);
    let to = input.get("_to").and_then(Value::as_str).map(str::to_string);
    StoredDocument {
        key: old.key.clone(),
        id: old.id,
        from: from.or_else(|| old.from.clone()),
        to: to.or_else(|| old.to.clone()),
        rev: rev.value(),
        attrs: user_attributes(input),
    }
}

/// Builds the remove-marker payload: `_key` and `_rev` only.
#[must_use]
pub fn new_object_for_remove(old: &StoredDocument, rev: RevisionId) -> StoredDocument {
    StoredDocument {
        key: old.key.clone(),
        id: old.id,
        from: None,
        to: None,
        rev: rev.value(),
        attrs: Vec::new(),
    }
}

/// Extracts the `_key` attribute of an input object, validating it.
///
/// # Errors
///
/// Returns [`Error::KeyBad`] when `_key` is present but not a valid key
/// string.
pub fn extract_key(input: &Value) -> Result<Option<String>> {
    match input.get("_key") {
        None => Ok(None),
        Some(Value::String(key)) => {
            validation::validate_document_key(key)
                .map_err(|e| Error::KeyBad { reason: e.to_string() })?;
            Ok(Some(key.clone()))
        },
        Some(_) => Err(Error::KeyBad { reason: "_key must be a string".to_string() }),
    }
}

/// Extracts the expected `_rev` of an input object, if present.
#[must_use]
pub fn extract_expected_rev(input: &Value) -> Option<RevisionId> {
    match input.get("_rev") {
        Some(Value::String(s)) => s.parse::<u64>().ok().map(RevisionId::new),
        Some(Value::Number(n)) => n.as_u64().map(RevisionId::new),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(key: &str, rev: u64, attrs: Value) -> StoredDocument {
        new_object_for_insert(&attrs, key.to_string(), 99, false, RevisionId::new(rev)).unwrap()
    }

    #[test]
    fn test_id_custom_form() {
        let id = DocumentId::new(0x0102_0304_0506_0708);
        assert_eq!(id.as_bytes()[0], ID_CUSTOM_TAG);
        assert_eq!(id.as_bytes().len(), 9);
        assert_eq!(id.target(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_insert_builds_user_attrs_in_order() {
        let document = doc("a", 1, json!({"x": 1, "b": "two", "_rev": "ignored"}));
        let names: Vec<&str> = document.attrs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["b", "x"]); // serde_json maps sort keys
        assert_eq!(document.key, "a");
        assert!(document.attr("_rev").is_none());
    }

    #[test]
    fn test_edge_requires_from_to() {
        let err = new_object_for_insert(
            &json!({"x": 1}),
            "e1".to_string(),
            7,
            true,
            RevisionId::new(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::KeyBad { .. }));

        let edge = new_object_for_insert(
            &json!({"_from": "v/1", "_to": "v/2"}),
            "e1".to_string(),
            7,
            true,
            RevisionId::new(1),
        )
        .unwrap();
        assert_eq!(edge.from.as_deref(), Some("v/1"));
        assert_eq!(edge.to.as_deref(), Some("v/2"));
    }

    #[test]
    fn test_body_roundtrip() {
        let document = doc("k1", 5, json!({"n": 1, "s": "x", "o": {"inner": [1, 2, null]}}));
        let bytes = document.to_bytes().unwrap();
        let back = StoredDocument::from_bytes(&bytes).unwrap();
        assert_eq!(back, document);
        assert_eq!(back.revision(), RevisionId::new(5));
    }

    #[test]
    fn test_merge_replaces_and_appends() {
        let old = doc("k", 1, json!({"a": 1, "b": 2}));
        let merged = merged_for_update(&old, &json!({"b": 3, "c": 4}), true, true, RevisionId::new(2));
        assert_eq!(merged.attr("a"), Some(&AttrValue::Int(1)));
        assert_eq!(merged.attr("b"), Some(&AttrValue::Int(3)));
        assert_eq!(merged.attr("c"), Some(&AttrValue::Int(4)));
        assert_eq!(merged.rev, 2);
    }

    #[test]
    fn test_merge_null_removes_unless_keep_null() {
        let old = doc("k", 1, json!({"a": 1, "b": 2}));
        let merged = merged_for_update(&old, &json!({"a": null}), true, false, RevisionId::new(2));
        assert!(merged.attr("a").is_none());
        let kept = merged_for_update(&old, &json!({"a": null}), true, true, RevisionId::new(2));
        assert_eq!(kept.attr("a"), Some(&AttrValue::Null));
    }

    #[test]
    fn test_merge_objects_recursive() {
        let old = doc("k", 1, json!({"nested": {"x": 1, "y": 2}}));
        let merged =
            merged_for_update(&old, &json!({"nested": {"y": 9}}), true, true, RevisionId::new(2));
        let Value::Object(nested) = Value::from(merged.attr("nested").unwrap()) else {
            panic!("expected object");
        };
        assert_eq!(nested["x"], json!(1));
        assert_eq!(nested["y"], json!(9));

        let replaced =
            merged_for_update(&old, &json!({"nested": {"y": 9}}), false, true, RevisionId::new(2));
        let Value::Object(nested) = Value::from(replaced.attr("nested").unwrap()) else {
            panic!("expected object");
        };
        assert!(!nested.contains_key("x"));
    }

    #[test]
    fn test_replace_keeps_identity_drops_attrs() {
        let old = doc("k", 1, json!({"a": 1}));
        let replaced = new_object_for_replace(&old, &json!({"z": 9}), RevisionId::new(2));
        assert_eq!(replaced.key, "k");
        assert_eq!(replaced.id, old.id);
        assert!(replaced.attr("a").is_none());
        assert_eq!(replaced.attr("z"), Some(&AttrValue::Int(9)));
    }

    #[test]
    fn test_remove_payload_is_key_and_rev_only() {
        let old = doc("k", 1, json!({"a": 1}));
        let removal = new_object_for_remove(&old, RevisionId::new(3));
        assert_eq!(removal.key, "k");
        assert_eq!(removal.rev, 3);
        assert!(removal.attrs.is_empty());
    }

    #[test]
    fn test_shard_key_value() {
        let document = doc("k9", 1, json!({"country": "de"}));
        assert_eq!(document.shard_key_value("_key"), AttrValue::String("k9".to_string()));
        assert_eq!(document.shard_key_value("country"), AttrValue::String("de".to_string()));
        assert_eq!(document.shard_key_value("missing"), AttrValue::Null);
    }

    #[test]
    fn test_extract_key_validation() {
        assert_eq!(extract_key(&json!({"_key": "ok"})).unwrap(), Some("ok".to_string()));
        assert_eq!(extract_key(&json!({})).unwrap(), None);
        assert!(extract_key(&json!({"_key": 5})).is_err());
        assert!(extract_key(&json!({"_key": "no spaces"})).is_err());
    }

    #[test]
    fn test_extract_expected_rev() {
        assert_eq!(extract_expected_rev(&json!({"_rev": "42"})), Some(RevisionId::new(42)));
        assert_eq!(extract_expected_rev(&json!({"_rev": 42})), Some(RevisionId::new(42)));
        assert_eq!(extract_expected_rev(&json!({})), None);
    }
}
