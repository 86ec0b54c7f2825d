//! Collection locking with deadlock detection.
//!
//! Writers take the collection lock exclusively, readers share it. When an
//! acquisition does not succeed on the first attempt, the thread registers
//! itself as blocked and enters a bounded exponential sleep-yield loop; the
//! deadlock detector is consulted every 5 iterations and acquisition fails
//! with a timeout after the configured bound (default 15 minutes).
//!
//! The detector keeps a process-wide wait-for graph: which thread holds
//! which collection, and which thread is blocked on which collection. A
//! cycle that leads back to the requesting thread is a deadlock.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// How many spin iterations pass between deadlock checks.
const DETECT_EVERY: u32 = 5;

/// Initial backoff sleep.
const BACKOFF_START: Duration = Duration::from_micros(10);

/// Backoff cap.
const BACKOFF_MAX: Duration = Duration::from_millis(1);

#[derive(Default)]
struct DetectorState {
    /// Exclusive holder per collection.
    writers: HashMap<u64, ThreadId>,
    /// Shared holders per collection.
    readers: HashMap<u64, HashSet<ThreadId>>,
    /// Collection each blocked thread is waiting for.
    waiters: HashMap<ThreadId, u64>,
}

/// Process-wide wait-for graph over collection locks.
#[derive(Default)]
pub struct DeadlockDetector {
    state: Mutex<DetectorState>,
}

impl DeadlockDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_waiting(&self, thread: ThreadId, collection: u64) {
        self.state.lock().waiters.insert(thread, collection);
    }

    fn clear_waiting(&self, thread: ThreadId) {
        self.state.lock().waiters.remove(&thread);
    }

    fn add_reader(&self, collection: u64, thread: ThreadId) {
        self.state.lock().readers.entry(collection).or_default().insert(thread);
    }

    fn remove_reader(&self, collection: u64, thread: ThreadId) {
        let mut state = self.state.lock();
        if let Some(set) = state.readers.get_mut(&collection) {
            set.remove(&thread);
            if set.is_empty() {
                state.readers.remove(&collection);
            }
        }
    }

    fn set_writer(&self, collection: u64, thread: ThreadId) {
        self.state.lock().writers.insert(collection, thread);
    }

    fn clear_writer(&self, collection: u64) {
        self.state.lock().writers.remove(&collection);
    }

    /// Whether `thread` blocking on `collection` closes a wait-for cycle.
    #[must_use]
    pub fn would_deadlock(&self, thread: ThreadId, collection: u64) -> bool {
        let state = self.state.lock();
        let mut visited = HashSet::new();
        let mut stack = vec![collection];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let mut holders: Vec<ThreadId> = Vec::new();
            if let Some(writer) = state.writers.get(&current) {
                holders.push(*writer);
            }
            if let Some(readers) = state.readers.get(&current) {
                holders.extend(readers.iter().copied());
            }
            for holder in holders {
                if holder == thread {
                    return true;
                }
                if let Some(next) = state.waiters.get(&holder) {
                    stack.push(*next);
                }
            }
        }
        false
    }
}

/// A read-write lock over `T` participating in deadlock detection.
pub struct DetectedRwLock<T> {
    collection: u64,
    inner: RwLock<T>,
    detector: Arc<DeadlockDetector>,
    timeout: Duration,
}

impl<T> DetectedRwLock<T> {
    /// Wraps a value; `collection` identifies this lock in the wait-for
    /// graph.
    pub fn new(
        collection: u64,
        value: T,
        detector: Arc<DeadlockDetector>,
        timeout: Duration,
    ) -> Self {
        Self { collection, inner: RwLock::new(value), detector, timeout }
    }

    /// Acquires the lock shared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] when waiting would close a cycle and
    /// [`Error::LockTimeout`] after the configured bound.
    pub fn read(&self) -> Result<DetectedReadGuard<'_, T>> {
        let thread = thread::current().id();
        if let Some(guard) = self.inner.try_read() {
            self.detector.add_reader(self.collection, thread);
            return Ok(DetectedReadGuard { lock: self, thread, guard });
        }
        let guard = self.wait(thread, |lock| lock.inner.try_read())?;
        self.detector.add_reader(self.collection, thread);
        Ok(DetectedReadGuard { lock: self, thread, guard })
    }

    /// Acquires the lock exclusive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deadlock`] when waiting would close a cycle and
    /// [`Error::LockTimeout`] after the configured bound.
    pub fn write(&self) -> Result<DetectedWriteGuard<'_, T>> {
        let thread = thread::current().id();
        if let Some(guard) = self.inner.try_write() {
            self.detector.set_writer(self.collection, thread);
            return Ok(DetectedWriteGuard { lock: self, guard });
        }
        let guard = self.wait(thread, |lock| lock.inner.try_write())?;
        self.detector.set_writer(self.collection, thread);
        Ok(DetectedWriteGuard { lock: self, guard })
    }

    fn wait<'a, G>(
        &'a self,
        thread: ThreadId,
        mut attempt: impl FnMut(&'a Self) -> Option<G>,
    ) -> Result<G> {
        self.detector.set_waiting(thread, self.collection);
        let deadline = Instant::now() + self.timeout;
        let mut backoff = BACKOFF_START;
        let mut iterations: u32 = 0;
        let result = loop {
            if let Some(guard) = attempt(self) {
                break Ok(guard);
            }
            iterations += 1;
            if iterations % DETECT_EVERY == 0
                && self.detector.would_deadlock(thread, self.collection)
            {
                break Err(Error::Deadlock { collection: self.collection });
            }
            if Instant::now() >= deadline {
                break Err(Error::LockTimeout { collection: self.collection });
            }
            thread::yield_now();
            thread::sleep(backoff);
            backoff = (backoff * 2).min(BACKOFF_MAX);
        };
        self.detector.clear_waiting(thread);
        result
    }
}

/// Shared guard; unregisters from the detector on drop.
pub struct DetectedReadGuard<'a, T> {
    lock: &'a DetectedRwLock<T>,
    thread: ThreadId,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for DetectedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for DetectedReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.detector.remove_reader(self.lock.collection, self.thread);
    }
}

/// Exclusive guard; unregisters from the detector on drop.
pub struct DetectedWriteGuard<'a, T> {
    lock: &'a DetectedRwLock<T>,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for DetectedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DetectedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for DetectedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.detector.clear_writer(self.lock.collection);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn lock_pair() -> (Arc<DetectedRwLock<u32>>, Arc<DetectedRwLock<u32>>) {
        let detector = Arc::new(DeadlockDetector::new());
        let a = Arc::new(DetectedRwLock::new(1, 0, detector.clone(), Duration::from_secs(5)));
        let b = Arc::new(DetectedRwLock::new(2, 0, detector, Duration::from_secs(5)));
        (a, b)
    }

    #[test]
    fn test_uncontended_read_write() {
        let (a, _) = lock_pair();
        {
            let mut guard = a.write().unwrap();
            *guard = 7;
        }
        assert_eq!(*a.read().unwrap(), 7);
    }

    #[test]
    fn test_concurrent_readers_share() {
        let (a, _) = lock_pair();
        let r1 = a.read().unwrap();
        let r2 = a.read().unwrap();
        assert_eq!(*r1, *r2);
    }

    // Timing-sensitive: scheduler contention from parallel tests can
    // stretch the backoff loop past the deadline check.
    #[test]
    #[serial]
    fn test_lock_timeout() {
        let detector = Arc::new(DeadlockDetector::new());
        let lock =
            Arc::new(DetectedRwLock::new(1, 0, detector, Duration::from_millis(50)));
        let _writer = lock.write().unwrap();
        let contender = lock.clone();
        let handle = std::thread::spawn(move || contender.write().map(|_| ()));
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::LockTimeout { collection: 1 })));
    }

    #[test]
    #[serial]
    fn test_ab_ba_deadlock_detected() {
        let (a, b) = lock_pair();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let (a1, b1, bar1) = (a.clone(), b.clone(), barrier.clone());
        let t1 = std::thread::spawn(move || {
            let _first = a1.write().unwrap();
            bar1.wait();
            b1.write().map(|_| ())
        });
        let (a2, b2, bar2) = (a, b, barrier);
        let t2 = std::thread::spawn(move || {
            let _first = b2.write().unwrap();
            bar2.wait();
            a2.write().map(|_| ())
        });

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        // At least one of the two must detect the cycle; neither may hang.
        assert!(
            matches!(r1, Err(Error::Deadlock { .. })) || matches!(r2, Err(Error::Deadlock { .. })),
            "no deadlock detected: {r1:?} / {r2:?}"
        );
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let (a, _) = lock_pair();
        drop(a.write().unwrap());
        // A second writer must succeed immediately.
        drop(a.write().unwrap());
    }
}
