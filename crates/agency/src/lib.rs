//! Agency interface for the arbor cluster supervisor.
//!
//! The agency is the replicated key-value store holding the authoritative
//! cluster plan and job queue. This crate does not implement consensus; it
//! provides:
//!
//! - [`tree::AgencyTree`] — immutable snapshots of the agency tree with
//!   path-based navigation
//! - [`envelope`] — the conditional multi-op transaction model
//!   (`[[ops], [preconditions]]`)
//! - [`client::AgencyClient`] — the narrow async interface the supervisor
//!   consumes
//! - [`mock::MockAgency`] — a complete in-process implementation of the
//!   transaction semantics, used by tests and single-node development

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod envelope;
pub mod mock;
pub mod paths;
pub mod tree;

pub use client::{AgencyClient, AgencyError, Result};
pub use envelope::{Op, Precondition, TransactOp, TransactResult, Transaction, WriteResult};
pub use mock::MockAgency;
pub use paths::AgencyPaths;
pub use tree::AgencyTree;
