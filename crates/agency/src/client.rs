//! The narrow async interface the supervisor consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::envelope::{TransactOp, TransactResult, Transaction, WriteResult};
use crate::tree::AgencyTree;

/// Errors surfaced by an agency connection.
#[derive(Debug, Snafu)]
pub enum AgencyError {
    /// The agency could not be reached or the request timed out.
    ///
    /// Always treated as transient: the supervisor logs it and retries with
    /// a fresh snapshot on the next tick.
    #[snafu(display("agency unavailable: {message}"))]
    Unavailable {
        /// Transport-level description.
        message: String,
    },

    /// The agency rejected the request as malformed.
    #[snafu(display("agency rejected request: {message}"))]
    Rejected {
        /// Rejection reason.
        message: String,
    },
}

/// Result type for agency operations.
pub type Result<T> = std::result::Result<T, AgencyError>;

/// Connection to the agency.
///
/// Implementations must guarantee that conditional transactions are applied
/// atomically against a single consistent state, so that two leaders racing
/// on the same preconditions cannot both succeed.
#[async_trait]
pub trait AgencyClient: Send + Sync {
    /// Reads the persistent tree at a consistent commit index.
    async fn read_db(&self) -> Result<AgencyTree>;

    /// Reads the ephemeral tree (per-leader, not replicated).
    async fn read_transient(&self) -> Result<AgencyTree>;

    /// Applies a batch of conditional transactions to the persistent tree.
    ///
    /// Transactions are applied independently; `indices[i] == 0` reports a
    /// precondition failure of transaction `i`.
    async fn write(&self, transactions: Vec<Transaction>) -> Result<WriteResult>;

    /// Applies a batch of transactions to the ephemeral tree.
    ///
    /// Transient writes are cheap and never replicated; heartbeat bookkeeping
    /// goes here so that it cannot saturate the replicated log.
    async fn write_transient(&self, transactions: Vec<Transaction>) -> Result<WriteResult>;

    /// Runs a mixed write/read envelope atomically.
    ///
    /// Read steps observe the tree with all preceding write steps of the
    /// same envelope applied, which is how callers atomically increment and
    /// re-read `/Sync/LatestID`.
    async fn transact(&self, ops: Vec<TransactOp>) -> Result<TransactResult>;

    /// Whether this node currently leads the agency.
    fn leading(&self) -> bool;

    /// The instant since which this node has been leading.
    fn leader_since(&self) -> DateTime<Utc>;

    /// Waits until the given commit index is replicated to a majority.
    ///
    /// Returns false when replication could not be confirmed.
    async fn wait_for(&self, index: u64) -> bool;
}
