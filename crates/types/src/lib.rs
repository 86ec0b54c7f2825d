//! Core types for the arbor document database.
//!
//! This crate provides the foundation shared by the storage engine and the
//! cluster supervisor:
//! - Newtype identifiers (collection ids, file ids, revision ids, ticks)
//! - The hybrid logical clock that mints revision ids
//! - Validated configuration structs
//! - Input validation (collection names, document keys, shard keys)
//! - Binary codec helpers

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod hlc;
pub mod ids;
pub mod validation;

// Re-export commonly used types at crate root
pub use codec::{CodecError, decode, encode};
pub use config::{ConfigError, StorageConfig, SupervisionConfig};
pub use hlc::HybridLogicalClock;
pub use ids::{CollectionId, FileId, PlanVersion, RevisionId, Tick};
pub use validation::ValidationError;
