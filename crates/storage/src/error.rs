//! Error types for the storage engine.
//!
//! One enum carries the whole taxonomy; operations surface errors to the
//! calling transaction, never across the engine's internal lock boundaries.

use std::io;

use snafu::Snafu;

use arbor_types::{CodecError, RevisionId, ValidationError};

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying byte store.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A datafile is corrupted or has an invalid format.
    #[snafu(display("corrupted datafile: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// The datafile cannot fit the requested marker.
    ///
    /// Internal to the journal rotation loop; never surfaced to operations.
    #[snafu(display("datafile full"))]
    DatafileFull,

    /// The datafile is sealed and no longer a write target.
    #[snafu(display("datafile {fid} is sealed"))]
    DatafileSealed {
        /// The sealed file.
        fid: u64,
    },

    /// No journal is available and one could not be created.
    #[snafu(display("no journal"))]
    NoJournal,

    /// The collection has been dropped.
    #[snafu(display("collection not found"))]
    CollectionNotFound,

    /// No document with the given key exists.
    #[snafu(display("document not found"))]
    DocumentNotFound,

    /// The document key is missing or malformed.
    #[snafu(display("bad document key: {reason}"))]
    KeyBad {
        /// What was wrong with the key.
        reason: String,
    },

    /// The key generator cannot produce further keys.
    #[snafu(display("out of keys"))]
    KeysExhausted,

    /// A unique secondary index rejected the document.
    ///
    /// Takes priority over less specific index errors when several indexes
    /// fail in one operation.
    #[snafu(display("unique constraint violated in index {index}"))]
    UniqueConstraintViolated {
        /// Name of the violated index.
        index: String,
    },

    /// The caller-supplied expected revision does not match the stored one.
    #[snafu(display("revision conflict: expected {expected}, found {found}"))]
    RevMismatch {
        /// Revision the caller expected.
        expected: RevisionId,
        /// Revision actually stored.
        found: RevisionId,
    },

    /// An update or replace would change a sharding attribute.
    #[snafu(display("must not change sharding attribute {attribute}"))]
    ShardKeysImmutable {
        /// The attribute whose value differed.
        attribute: String,
    },

    /// Lock acquisition detected a deadlock cycle.
    #[snafu(display("deadlock detected on collection {collection}"))]
    Deadlock {
        /// The collection being locked.
        collection: u64,
    },

    /// Lock acquisition exceeded the configured timeout.
    #[snafu(display("timed out waiting for lock on collection {collection}"))]
    LockTimeout {
        /// The collection being locked.
        collection: u64,
    },

    /// A revision id present in an index has no cache entry.
    #[snafu(display("invalid revision {revision} on lookup"))]
    InvalidRevision {
        /// The dangling revision.
        revision: RevisionId,
    },

    /// Document body encoding or decoding failed.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: CodecError,
    },

    /// Collection metadata validation failed.
    #[snafu(display("validation error: {source}"))]
    Validation {
        /// The underlying validation error.
        source: ValidationError,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<CodecError> for Error {
    fn from(source: CodecError) -> Self {
        Error::Codec { source }
    }
}

impl From<ValidationError> for Error {
    fn from(source: ValidationError) -> Self {
        Error::Validation { source }
    }
}
