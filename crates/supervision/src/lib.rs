//! arbor-supervision: the cluster control plane.
//!
//! One long-lived supervisor task runs per cluster; only the instance on
//! the current agency leader performs work. Every tick it snapshots the
//! agency's persistent and transient trees, evaluates node health, repairs
//! under-replicated shards, shrinks over-provisioned clusters and drives
//! in-flight jobs forward.
//!
//! All mutations go through conditional agency transactions carrying the
//! state the supervisor observed, so a stale leader's writes are rejected
//! instead of corrupting cluster state.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod enforce;
pub mod error;
pub mod health;
pub mod jobs;
pub mod shrink;
pub mod supervisor;

pub use error::{Result, SupervisionError};
pub use health::{HealthCheck, HealthStatus};
pub use jobs::{JobEnv, JobIdAllocator, JobStatus, JobType};
pub use supervisor::{Supervisor, TickOutcome};
