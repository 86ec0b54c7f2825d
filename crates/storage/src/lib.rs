//! arbor-storage: the append-only storage engine of an arbor data node.
//!
//! Each logical collection owns an ordered set of sealed **datafiles**, at
//! most one open **journal** (the only append target) and at most one
//! **compactor** (the only merge target). Writers append a marker to the
//! journal and update the in-memory indexes; readers traverse the indexes
//! and dereference document positions through the revision cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Collection API                   │
//! │   (insert, update, replace, remove, read)    │
//! └────────────────┬─────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────┐
//! │     Indexes + revision cache                  │
//! │ (primary key → revision → document position) │
//! └────────────────┬─────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────┐
//! │     StorageBackend (AppendStore)              │
//! │  (journal rotation, sealing, compact hooks)  │
//! └────────────────┬─────────────────────────────┘
//!                  │
//! ┌────────────────▼─────────────────────────────┐
//! │          Datafiles (ByteStore)                │
//! │        (FileStore / MemoryStore)             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Crash consistency comes from the marker format: every marker carries a
//! checksum and recovery replays files in fid order, stopping at the first
//! torn marker (`size == 0` or checksum mismatch in the tail).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod collection;
pub mod datafile;
pub mod document;
pub mod error;
pub mod indexes;
pub mod key_generator;
pub mod lock;
pub mod marker;
pub mod physical;
pub mod recovery;
pub mod revision_cache;
pub mod stats;

pub use backend::{ByteStore, FileStore, MemoryStore};
pub use collection::{
    Collection, CollectionInfo, CollectionType, OperationOptions, OperationResult,
};
pub use datafile::{Datafile, DatafileState};
pub use document::{AttrValue, DocumentId, StoredDocument};
pub use error::{Error, Result};
pub use indexes::{EdgeIndex, HashIndex, PrimaryIndex, SecondaryIndex};
pub use key_generator::{KeyGenerator, TraditionalKeyGenerator};
pub use lock::{DeadlockDetector, DetectedRwLock};
pub use marker::{MARKER_HEADER_SIZE, MarkerHeader, MarkerType};
pub use physical::{AppendStore, StorageBackend};
pub use revision_cache::{DocumentPosition, RevisionCache};
pub use stats::{DatafileStatistics, StatsContainer};

/// Datafile format version.
pub const FORMAT_VERSION: u32 = 1;
