//! Conditional multi-op transaction envelopes.
//!
//! Every mutation of cluster state travels as a transaction of the form
//! `[[ops], [preconditions]]`: a set of path-addressed operations plus a set
//! of preconditions asserting the state the writer observed. A stale writer's
//! preconditions fail and the transaction is rejected without effect.

use serde_json::{Map, Value, json};

/// One path-addressed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Set the leaf (or subtree) at the path to the given value.
    Set(Value),
    /// Delete the node at the path.
    Delete,
    /// Append a value to the array at the path, creating the array if
    /// missing.
    Push(Value),
    /// Remove every element equal to the value from the array at the path.
    Erase(Value),
    /// Add `step` to the numeric leaf at the path, creating it at `step`.
    Increment {
        /// The increment amount.
        step: u64,
    },
}

/// One path-addressed precondition.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// The leaf at the path must equal the value exactly.
    Equals(Value),
    /// Same as [`Precondition::Equals`] in the explicit `{old: v}` form.
    Old(Value),
    /// `true`: the path must be absent or an empty object;
    /// `false`: the path must exist.
    OldEmpty(bool),
}

/// A conditional transaction: operations plus preconditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    /// Operations, applied atomically in order.
    pub ops: Vec<(String, Op)>,
    /// Preconditions, all evaluated against the pre-transaction tree.
    pub preconditions: Vec<(String, Precondition)>,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a set operation.
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Set(value)));
        self
    }

    /// Adds a delete operation.
    #[must_use]
    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.ops.push((path.into(), Op::Delete));
        self
    }

    /// Adds a push operation.
    #[must_use]
    pub fn push(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Push(value)));
        self
    }

    /// Adds an erase operation.
    #[must_use]
    pub fn erase(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Erase(value)));
        self
    }

    /// Adds an increment operation with step 1.
    #[must_use]
    pub fn increment(self, path: impl Into<String>) -> Self {
        self.increment_by(path, 1)
    }

    /// Adds an increment operation with an explicit step.
    #[must_use]
    pub fn increment_by(mut self, path: impl Into<String>, step: u64) -> Self {
        self.ops.push((path.into(), Op::Increment { step }));
        self
    }

    /// Adds an equality precondition.
    #[must_use]
    pub fn require_equals(mut self, path: impl Into<String>, value: Value) -> Self {
        self.preconditions.push((path.into(), Precondition::Equals(value)));
        self
    }

    /// Adds an `{old: v}` precondition.
    #[must_use]
    pub fn require_old(mut self, path: impl Into<String>, value: Value) -> Self {
        self.preconditions.push((path.into(), Precondition::Old(value)));
        self
    }

    /// Adds an `{oldEmpty: b}` precondition.
    #[must_use]
    pub fn require_old_empty(mut self, path: impl Into<String>, empty: bool) -> Self {
        self.preconditions.push((path.into(), Precondition::OldEmpty(empty)));
        self
    }

    /// Returns true when the transaction carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Renders the `[[ops], [preconds]]` wire shape, mainly for logging.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut ops = Map::new();
        for (path, op) in &self.ops {
            let rendered = match op {
                Op::Set(v) => v.clone(),
                Op::Delete => json!({"op": "delete"}),
                Op::Push(v) => json!({"op": "push", "new": v}),
                Op::Erase(v) => json!({"op": "erase", "val": v}),
                Op::Increment { step } => json!({"op": "increment", "step": step}),
            };
            ops.insert(path.clone(), rendered);
        }
        let mut preconds = Map::new();
        for (path, precond) in &self.preconditions {
            let rendered = match precond {
                Precondition::Equals(v) => v.clone(),
                Precondition::Old(v) => json!({"old": v}),
                Precondition::OldEmpty(b) => json!({"oldEmpty": b}),
            };
            preconds.insert(path.clone(), rendered);
        }
        if preconds.is_empty() {
            json!([Value::Object(ops)])
        } else {
            json!([Value::Object(ops), Value::Object(preconds)])
        }
    }
}

/// Result of a `write` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Whether the batch reached the agency at all.
    pub accepted: bool,
    /// Per-transaction commit indices; `0` signals a precondition failure.
    pub indices: Vec<u64>,
}

impl WriteResult {
    /// True when the batch was accepted and every transaction applied.
    #[must_use]
    pub fn all_applied(&self) -> bool {
        self.accepted && !self.indices.is_empty() && self.indices.iter().all(|&i| i != 0)
    }

    /// True when the batch was accepted as exactly one applied transaction.
    ///
    /// This is the success test virtually every job uses after submitting its
    /// single transaction.
    #[must_use]
    pub fn applied_one(&self) -> bool {
        self.accepted && self.indices.len() == 1 && self.indices[0] != 0
    }
}

/// One step of a `transact` envelope: either a conditional write or a read.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactOp {
    /// A conditional write transaction.
    Write(Transaction),
    /// A read of the values at the given absolute paths.
    Read(Vec<String>),
}

/// Result of a `transact` envelope.
///
/// `results[i]` corresponds to step `i`: the commit index for an applied
/// write, `Value::Null` for a rejected one, and for reads an object mapping
/// each requested path to its value.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactResult {
    /// Whether the envelope reached the agency at all.
    pub accepted: bool,
    /// Per-step results.
    pub results: Vec<Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_ops_in_order() {
        let tx = Transaction::new()
            .set("/a", json!(1))
            .delete("/b")
            .push("/c", json!("x"))
            .increment_by("/d", 5);
        assert_eq!(tx.ops.len(), 4);
        assert_eq!(tx.ops[0].0, "/a");
        assert_eq!(tx.ops[3].1, Op::Increment { step: 5 });
    }

    #[test]
    fn test_wire_shape() {
        let tx = Transaction::new()
            .set("/x", json!(7))
            .erase("/list", json!("gone"))
            .require_old_empty("/lock", true);
        let wire = tx.to_json();
        assert_eq!(
            wire,
            json!([
                {"/x": 7, "/list": {"op": "erase", "val": "gone"}},
                {"/lock": {"oldEmpty": true}},
            ])
        );
    }

    #[test]
    fn test_wire_shape_without_preconditions() {
        let wire = Transaction::new().delete("/x").to_json();
        assert_eq!(wire, json!([{"/x": {"op": "delete"}}]));
    }

    #[test]
    fn test_write_result_predicates() {
        assert!(WriteResult { accepted: true, indices: vec![4] }.applied_one());
        assert!(!WriteResult { accepted: true, indices: vec![0] }.applied_one());
        assert!(!WriteResult { accepted: false, indices: vec![4] }.applied_one());
        assert!(!WriteResult { accepted: true, indices: vec![4, 5] }.applied_one());
        assert!(WriteResult { accepted: true, indices: vec![4, 5] }.all_applied());
        assert!(!WriteResult { accepted: true, indices: vec![4, 0] }.all_applied());
    }
}
