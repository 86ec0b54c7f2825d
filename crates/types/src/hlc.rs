//! Hybrid logical clock for revision id generation.
//!
//! Revision ids are 64-bit values combining wall-clock time with a sequence
//! counter. They are strictly monotone within a process, roughly time-ordered,
//! and ingestible: observing a higher incoming value (e.g. during restore)
//! advances the local clock so that subsequently minted ids sort after it.
//!
//! # ID Structure
//!
//! ```text
//! | 44 bits: timestamp (ms since epoch) | 20 bits: sequence |
//! ```
//!
//! - **Timestamp**: milliseconds since 2021-01-01 00:00:00 UTC
//! - **Sequence**: counter within each millisecond (~1M ids/ms)
//!
//! # Thread Safety
//!
//! Clock state lives behind a `parking_lot::Mutex`; the lock is held only for
//! the duration of the increment.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::ids::{RevisionId, Tick};

/// Custom epoch: 2021-01-01 00:00:00 UTC (milliseconds since Unix epoch).
const EPOCH_MS: u64 = 1_609_459_200_000;

/// Number of bits used for the sequence portion.
const SEQUENCE_BITS: u32 = 20;

/// Mask for extracting the sequence portion.
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Mutable clock state.
struct ClockState {
    /// The highest value handed out or observed so far.
    last: u64,
}

/// Hybrid logical clock.
///
/// One instance per process is shared between all collections so that
/// revision ids are globally monotone on the node.
pub struct HybridLogicalClock {
    state: Mutex<ClockState>,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Creates a clock starting at the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(ClockState { last: 0 }) }
    }

    /// Mints the next tick.
    ///
    /// If the wall clock advanced past the last handed-out value, the new
    /// value is wall-based with sequence 0. Otherwise (same millisecond or a
    /// clock running backwards) the counter portion is incremented, which
    /// keeps the result strictly greater than every previous one.
    pub fn next(&self) -> Tick {
        let physical = wall_ms().saturating_sub(EPOCH_MS) << SEQUENCE_BITS;
        let mut state = self.state.lock();
        let candidate = if physical > state.last { physical } else { state.last + 1 };
        state.last = candidate;
        Tick::new(candidate)
    }

    /// Mints the next revision id.
    pub fn next_revision(&self) -> RevisionId {
        self.next().into()
    }

    /// Ingests an externally produced value (restore, replication).
    ///
    /// After `observe(v)`, every subsequent `next()` returns a value greater
    /// than `v`.
    pub fn observe(&self, incoming: u64) {
        let mut state = self.state.lock();
        if incoming > state.last {
            state.last = incoming;
        }
    }

    /// Returns the last value handed out or observed.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.state.lock().last
    }
}

/// Extracts the wall-clock portion of a tick, in milliseconds since the
/// custom epoch.
#[must_use]
pub fn extract_timestamp(value: u64) -> u64 {
    value >> SEQUENCE_BITS
}

/// Extracts the sequence portion of a tick.
#[must_use]
pub fn extract_sequence(value: u64) -> u64 {
    value & SEQUENCE_MASK
}

fn wall_ms() -> u64 {
    // A clock before the Unix epoch degenerates to pure counter mode, which
    // is still monotone.
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_next_is_strictly_monotone() {
        let clock = HybridLogicalClock::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let tick = clock.next().value();
            assert!(tick > last, "tick {tick} not greater than {last}");
            last = tick;
        }
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let clock = std::sync::Arc::new(HybridLogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.next().value()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate tick {id}");
            }
        }
    }

    #[test]
    fn test_observe_advances_clock() {
        let clock = HybridLogicalClock::new();
        let first = clock.next().value();
        let far_future = first + (1 << 40);
        clock.observe(far_future);
        let after = clock.next().value();
        assert!(after > far_future);
    }

    #[test]
    fn test_observe_smaller_value_is_ignored() {
        let clock = HybridLogicalClock::new();
        let first = clock.next().value();
        clock.observe(1);
        assert_eq!(clock.current(), first);
    }

    #[test]
    fn test_timestamp_roughly_tracks_wall_clock() {
        let clock = HybridLogicalClock::new();
        let tick = clock.next().value();
        let now = wall_ms() - EPOCH_MS;
        let ts = extract_timestamp(tick);
        assert!(ts <= now + 1, "timestamp {ts} ahead of wall clock {now}");
        assert!(ts + 60_000 > now, "timestamp {ts} more than a minute behind {now}");
    }

    #[test]
    fn test_extract_roundtrip() {
        let clock = HybridLogicalClock::new();
        let tick = clock.next().value();
        let rebuilt = (extract_timestamp(tick) << SEQUENCE_BITS) | extract_sequence(tick);
        assert_eq!(tick, rebuilt);
    }
}
