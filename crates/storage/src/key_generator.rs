//! Document key generation.
//!
//! The traditional generator mints monotone decimal strings from the tick
//! supplied by the caller and tracks the highest numeric key it has seen so
//! that recovery and restores never hand out a key twice.

use std::sync::atomic::{AtomicU64, Ordering};

use arbor_types::validation::validate_document_key;

use crate::error::{Error, Result};

/// Pluggable key generator.
pub trait KeyGenerator: Send + Sync {
    /// Produces a fresh key from a monotone tick, or `None` when exhausted.
    fn generate(&self, tick: u64) -> Option<String>;

    /// Validates a user-supplied key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyBad`] for malformed keys and for keys this
    /// generator refuses outside restores.
    fn validate(&self, key: &str, is_restore: bool) -> Result<()>;

    /// Observes a key during recovery or restore.
    fn track(&self, key: &str);
}

/// The traditional generator: monotone decimal string keys.
#[derive(Debug, Default)]
pub struct TraditionalKeyGenerator {
    /// Highest numeric key seen or generated.
    last: AtomicU64,
    /// Whether user-supplied keys are accepted at all.
    allow_user_keys: bool,
}

impl TraditionalKeyGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(allow_user_keys: bool) -> Self {
        Self { last: AtomicU64::new(0), allow_user_keys }
    }

    /// The highest key value observed so far.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl KeyGenerator for TraditionalKeyGenerator {
    fn generate(&self, tick: u64) -> Option<String> {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = tick.max(current + 1);
            match self.last.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Some(next.to_string()),
                Err(observed) => current = observed,
            }
        }
    }

    fn validate(&self, key: &str, is_restore: bool) -> Result<()> {
        validate_document_key(key).map_err(|e| Error::KeyBad { reason: e.to_string() })?;
        if !self.allow_user_keys && !is_restore {
            return Err(Error::KeyBad {
                reason: "collection does not allow user-supplied keys".to_string(),
            });
        }
        Ok(())
    }

    fn track(&self, key: &str) {
        if let Ok(value) = key.parse::<u64>() {
            self.last.fetch_max(value, Ordering::SeqCst);
        }
    }
}
