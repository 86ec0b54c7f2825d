//! In-process agency with full conditional-transaction semantics.
//!
//! Backs every supervision test and doubles as the single-node development
//! agency. Implements the documented op set (set, delete, push, erase,
//! increment) and precondition set (leaf equality, `{old}`, `{oldEmpty}`)
//! against two JSON trees: the persistent one and the per-leader transient
//! one.
//!
//! Transactions inside one batch are applied in order and independently:
//! a precondition failure rejects only its own transaction (reported as
//! commit index 0) while the rest proceed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::client::{AgencyClient, AgencyError, Result};
use crate::envelope::{Op, Precondition, TransactOp, TransactResult, Transaction, WriteResult};
use crate::tree::AgencyTree;

/// In-memory agency.
pub struct MockAgency {
    persistent: Mutex<Value>,
    transient: Mutex<Value>,
    commit_index: AtomicU64,
    leading: AtomicBool,
    leader_since: Mutex<DateTime<Utc>>,
    unavailable: AtomicBool,
}

impl Default for MockAgency {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgency {
    /// Creates an empty agency that considers itself leading.
    #[must_use]
    pub fn new() -> Self {
        Self {
            persistent: Mutex::new(Value::Object(Map::new())),
            transient: Mutex::new(Value::Object(Map::new())),
            commit_index: AtomicU64::new(0),
            leading: AtomicBool::new(true),
            leader_since: Mutex::new(Utc::now()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Directly sets a value in the persistent tree (test seeding).
    pub fn seed(&self, path: &str, value: Value) {
        set_at(&mut self.persistent.lock(), path, value);
    }

    /// Directly sets a value in the transient tree (test seeding).
    pub fn seed_transient(&self, path: &str, value: Value) {
        set_at(&mut self.transient.lock(), path, value);
    }

    /// Returns a snapshot of the persistent tree (synchronous, for tests).
    #[must_use]
    pub fn persistent_snapshot(&self) -> AgencyTree {
        AgencyTree::new(self.persistent.lock().clone())
    }

    /// Returns a snapshot of the transient tree (synchronous, for tests).
    #[must_use]
    pub fn transient_snapshot(&self) -> AgencyTree {
        AgencyTree::new(self.transient.lock().clone())
    }

    /// Flips leadership; gaining leadership resets `leader_since`.
    pub fn set_leading(&self, leading: bool) {
        let was = self.leading.swap(leading, Ordering::SeqCst);
        if leading && !was {
            *self.leader_since.lock() = Utc::now();
        }
    }

    /// Overrides the leadership start instant (test time travel).
    pub fn set_leader_since(&self, since: DateTime<Utc>) {
        *self.leader_since.lock() = since;
    }

    /// Makes every call fail with [`AgencyError::Unavailable`] when set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current commit index.
    #[must_use]
    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AgencyError::Unavailable { message: "mock agency offline".to_string() });
        }
        Ok(())
    }

    fn apply_to(&self, tree: &mut Value, tx: &Transaction) -> u64 {
        for (path, precondition) in &tx.preconditions {
            if !check_precondition(tree, path, precondition) {
                tracing::debug!(path = %path, "precondition failed");
                return 0;
            }
        }
        for (path, op) in &tx.ops {
            apply_op(tree, path, op);
        }
        self.commit_index.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl AgencyClient for MockAgency {
    async fn read_db(&self) -> Result<AgencyTree> {
        self.check_available()?;
        Ok(AgencyTree::new(self.persistent.lock().clone()))
    }

    async fn read_transient(&self) -> Result<AgencyTree> {
        self.check_available()?;
        Ok(AgencyTree::new(self.transient.lock().clone()))
    }

    async fn write(&self, transactions: Vec<Transaction>) -> Result<WriteResult> {
        self.check_available()?;
        let mut tree = self.persistent.lock();
        let indices = transactions.iter().map(|tx| self.apply_to(&mut tree, tx)).collect();
        Ok(WriteResult { accepted: true, indices })
    }

    async fn write_transient(&self, transactions: Vec<Transaction>) -> Result<WriteResult> {
        self.check_available()?;
        let mut tree = self.transient.lock();
        let indices = transactions.iter().map(|tx| self.apply_to(&mut tree, tx)).collect();
        Ok(WriteResult { accepted: true, indices })
    }

    async fn transact(&self, ops: Vec<TransactOp>) -> Result<TransactResult> {
        self.check_available()?;
        let mut tree = self.persistent.lock();
        let mut results = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                TransactOp::Write(tx) => {
                    let index = self.apply_to(&mut tree, tx);
                    results.push(if index == 0 { Value::Null } else { Value::from(index) });
                },
                TransactOp::Read(paths) => {
                    let mut read = Map::new();
                    for path in paths {
                        let value = lookup(&tree, path).cloned().unwrap_or(Value::Null);
                        read.insert(path.clone(), value);
                    }
                    results.push(Value::Object(read));
                },
            }
        }
        Ok(TransactResult { accepted: true, results })
    }

    fn leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    fn leader_since(&self) -> DateTime<Utc> {
        *self.leader_since.lock()
    }

    async fn wait_for(&self, index: u64) -> bool {
        index <= self.commit_index.load(Ordering::SeqCst)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments(path) {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Navigates to the node at `path`, creating intermediate objects.
fn lookup_create<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
    let mut node = root;
    for segment in segments(path) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .map(|map| map.entry(segment.to_string()).or_insert(Value::Null))
            .unwrap_or_else(|| unreachable!("object ensured above"));
    }
    node
}

fn set_at(root: &mut Value, path: &str, value: Value) {
    *lookup_create(root, path) = value;
}

fn delete_at(root: &mut Value, path: &str) {
    let segs: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = segs.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    let mut node = root;
    for segment in parents {
        match node.as_object_mut().and_then(|map| map.get_mut(*segment)) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(map) = node.as_object_mut() {
        map.remove(*last);
    }
}

fn apply_op(root: &mut Value, path: &str, op: &Op) {
    match op {
        Op::Set(value) => set_at(root, path, value.clone()),
        Op::Delete => delete_at(root, path),
        Op::Push(value) => {
            let node = lookup_create(root, path);
            match node {
                Value::Array(items) => items.push(value.clone()),
                _ => *node = Value::Array(vec![value.clone()]),
            }
        },
        Op::Erase(value) => {
            let retained: Option<Vec<Value>> = match lookup(root, path) {
                Some(Value::Array(items)) => {
                    Some(items.iter().filter(|item| *item != value).cloned().collect())
                },
                _ => None,
            };
            if let Some(items) = retained {
                set_at(root, path, Value::Array(items));
            }
        },
        Op::Increment { step } => {
            let node = lookup_create(root, path);
            let current = node.as_u64().unwrap_or(0);
            *node = Value::from(current + step);
        },
    }
}

fn check_precondition(root: &Value, path: &str, precondition: &Precondition) -> bool {
    let found = lookup(root, path);
    match precondition {
        Precondition::Equals(expected) | Precondition::Old(expected) => found == Some(expected),
        Precondition::OldEmpty(true) => {
            matches!(found, None | Some(Value::Null))
        },
        Precondition::OldEmpty(false) => !matches!(found, None | Some(Value::Null)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    fn write_one(agency: &MockAgency, tx: Transaction) -> WriteResult {
        futures_block_on(agency.write(vec![tx])).unwrap()
    }

    /// Minimal executor: the mock never actually awaits anything.
    fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_set_and_read() {
        let agency = MockAgency::new();
        let result = write_one(&agency, Transaction::new().set("/a/b", json!(1)));
        assert!(result.applied_one());
        assert_eq!(agency.persistent_snapshot().u64_at("/a/b"), Some(1));
    }

    #[test]
    fn test_delete_removes_subtree() {
        let agency = MockAgency::new();
        agency.seed("/a/b/c", json!(1));
        write_one(&agency, Transaction::new().delete("/a/b"));
        assert!(!agency.persistent_snapshot().has("/a/b"));
        assert!(agency.persistent_snapshot().has("/a"));
    }

    #[test]
    fn test_push_creates_and_appends() {
        let agency = MockAgency::new();
        write_one(&agency, Transaction::new().push("/list", json!("x")));
        write_one(&agency, Transaction::new().push("/list", json!("y")));
        assert_eq!(agency.persistent_snapshot().string_list("/list"), vec!["x", "y"]);
    }

    #[test]
    fn test_erase_removes_matching_values() {
        let agency = MockAgency::new();
        agency.seed("/list", json!(["a", "b", "a"]));
        write_one(&agency, Transaction::new().erase("/list", json!("a")));
        assert_eq!(agency.persistent_snapshot().string_list("/list"), vec!["b"]);
    }

    #[test]
    fn test_increment_with_step() {
        let agency = MockAgency::new();
        write_one(&agency, Transaction::new().increment_by("/Sync/LatestID", 10_000));
        write_one(&agency, Transaction::new().increment("/Sync/LatestID"));
        assert_eq!(agency.persistent_snapshot().u64_at("/Sync/LatestID"), Some(10_001));
    }

    #[test]
    fn test_precondition_failure_reports_index_zero() {
        let agency = MockAgency::new();
        agency.seed("/lock", json!({"jobId": "1"}));
        let result = write_one(
            &agency,
            Transaction::new().set("/x", json!(1)).require_old_empty("/lock", true),
        );
        assert!(result.accepted);
        assert_eq!(result.indices, vec![0]);
        assert!(!agency.persistent_snapshot().has("/x"));
    }

    #[test]
    fn test_conflicting_writers_at_most_one_succeeds() {
        // Two supervisors observed value 1 and race to bump it.
        let agency = MockAgency::new();
        agency.seed("/Plan/Version", json!(1));
        let winner = Transaction::new()
            .set("/Plan/Version", json!(2))
            .require_old("/Plan/Version", json!(1));
        let loser = winner.clone();
        let result = futures_block_on(agency.write(vec![winner, loser])).unwrap();
        assert_eq!(result.indices.iter().filter(|&&i| i != 0).count(), 1);
        assert_eq!(agency.persistent_snapshot().u64_at("/Plan/Version"), Some(2));
    }

    #[test]
    fn test_transact_write_then_read_sees_write() {
        let agency = MockAgency::new();
        let result = futures_block_on(agency.transact(vec![
            TransactOp::Write(Transaction::new().increment_by("/Sync/LatestID", 10_000)),
            TransactOp::Read(vec!["/Sync/LatestID".to_string()]),
        ]))
        .unwrap();
        assert!(result.accepted);
        assert_eq!(result.results[1]["/Sync/LatestID"], json!(10_000));
    }

    #[test]
    fn test_transient_is_separate() {
        let agency = MockAgency::new();
        futures_block_on(
            agency.write_transient(vec![Transaction::new().set("/hb", json!("t1"))]),
        );
        assert!(agency.transient_snapshot().has("/hb"));
        assert!(!agency.persistent_snapshot().has("/hb"));
    }

    #[test]
    fn test_old_empty_false_requires_presence() {
        let agency = MockAgency::new();
        let result =
            write_one(&agency, Transaction::new().set("/y", json!(2)).require_old_empty("/x", false));
        assert_eq!(result.indices, vec![0]);
        agency.seed("/x", json!(1));
        let result =
            write_one(&agency, Transaction::new().set("/y", json!(2)).require_old_empty("/x", false));
        assert!(result.applied_one());
    }

    #[test]
    fn test_unavailable_mode() {
        let agency = MockAgency::new();
        agency.set_unavailable(true);
        let err = futures_block_on(agency.read_db()).unwrap_err();
        assert!(matches!(err, AgencyError::Unavailable { .. }));
    }

    #[test]
    fn test_wait_for_tracks_commit_index() {
        let agency = MockAgency::new();
        write_one(&agency, Transaction::new().set("/a", json!(1)));
        assert!(futures_block_on(agency.wait_for(1)));
        assert!(!futures_block_on(agency.wait_for(2)));
    }
}
