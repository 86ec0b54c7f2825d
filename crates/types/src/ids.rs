//! Newtype identifiers used across the storage engine and supervisor.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw u64 value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }

            /// Returns true when this is the zero (unset) id.
            #[must_use]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

id_newtype! {
    /// Local identifier of a logical collection (`cid`).
    CollectionId
}

id_newtype! {
    /// Identifier of one datafile, unique and ascending per collection (`fid`).
    FileId
}

id_newtype! {
    /// Revision id labelling one version of a document.
    ///
    /// Minted by the hybrid logical clock; strictly monotone per process.
    RevisionId
}

id_newtype! {
    /// Logical tick stamped into datafile markers.
    Tick
}

id_newtype! {
    /// Version counter of the cluster plan (`/Plan/Version`).
    PlanVersion
}

impl From<Tick> for RevisionId {
    fn from(tick: Tick) -> Self {
        Self(tick.0)
    }
}

impl From<RevisionId> for Tick {
    fn from(rev: RevisionId) -> Self {
        Self(rev.0)
    }
}
