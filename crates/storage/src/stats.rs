//! Per-datafile statistics.
//!
//! Every datafile has a statistics container tracking how much of its
//! content is alive, dead (superseded or removed) and how many deletion
//! markers it holds. The compactor uses these numbers to pick files worth
//! merging.

use dashmap::DashMap;

use arbor_types::FileId;

/// Statistics for one datafile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsContainer {
    /// Number of live documents whose current revision lives in the file.
    pub number_alive: u64,
    /// Bytes occupied by live documents.
    pub size_alive: u64,
    /// Number of superseded or removed documents still in the file.
    pub number_dead: u64,
    /// Bytes occupied by dead documents.
    pub size_dead: u64,
    /// Number of remove markers in the file.
    pub number_deletions: u64,
}

impl StatsContainer {
    /// Adds another container's counters onto this one.
    pub fn add(&mut self, other: &StatsContainer) {
        self.number_alive += other.number_alive;
        self.size_alive += other.size_alive;
        self.number_dead += other.number_dead;
        self.size_dead += other.size_dead;
        self.number_deletions += other.number_deletions;
    }
}

/// Statistics for all datafiles of one collection.
#[derive(Debug, Default)]
pub struct DatafileStatistics {
    containers: DashMap<FileId, StatsContainer>,
}

impl DatafileStatistics {
    /// Creates an empty statistics set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a container exists for the file.
    pub fn create(&self, fid: FileId) {
        self.containers.entry(fid).or_default();
    }

    /// Creates a container pre-filled with the given values (recovery).
    pub fn create_with(&self, fid: FileId, values: StatsContainer) {
        let mut entry = self.containers.entry(fid).or_default();
        entry.add(&values);
    }

    /// Records a freshly written live document.
    pub fn increase_alive(&self, fid: FileId, count: u64, size: u64) {
        let mut entry = self.containers.entry(fid).or_default();
        entry.number_alive += count;
        entry.size_alive += size;
    }

    /// Moves a document from the alive to the dead account.
    pub fn increase_dead(&self, fid: FileId, count: u64, size: u64) {
        let mut entry = self.containers.entry(fid).or_default();
        entry.number_dead += count;
        entry.size_dead += size;
        entry.number_alive = entry.number_alive.saturating_sub(count);
        entry.size_alive = entry.size_alive.saturating_sub(size);
    }

    /// Records a deletion marker.
    pub fn increase_deletions(&self, fid: FileId, count: u64) {
        let mut entry = self.containers.entry(fid).or_default();
        entry.number_deletions += count;
    }

    /// Returns a copy of one file's container, if present.
    #[must_use]
    pub fn get(&self, fid: FileId) -> Option<StatsContainer> {
        self.containers.get(&fid).map(|entry| *entry)
    }

    /// Drops the container of a removed datafile.
    pub fn remove(&self, fid: FileId) {
        self.containers.remove(&fid);
    }

    /// Aggregates all containers.
    #[must_use]
    pub fn all(&self) -> StatsContainer {
        let mut total = StatsContainer::default();
        for entry in self.containers.iter() {
            total.add(&entry);
        }
        total
    }

    /// Number of tracked files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether no files are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_then_dead_accounting() {
        let stats = DatafileStatistics::new();
        let fid = FileId::new(1);
        stats.create(fid);
        stats.increase_alive(fid, 2, 200);
        stats.increase_dead(fid, 1, 80);
        let container = stats.get(fid).unwrap();
        assert_eq!(container.number_alive, 1);
        assert_eq!(container.size_alive, 120);
        assert_eq!(container.number_dead, 1);
        assert_eq!(container.size_dead, 80);
    }

    #[test]
    fn test_dead_saturates_at_zero() {
        let stats = DatafileStatistics::new();
        let fid = FileId::new(2);
        stats.increase_dead(fid, 3, 100);
        let container = stats.get(fid).unwrap();
        assert_eq!(container.number_alive, 0);
        assert_eq!(container.number_dead, 3);
    }

    #[test]
    fn test_aggregate() {
        let stats = DatafileStatistics::new();
        stats.increase_alive(FileId::new(1), 1, 10);
        stats.increase_alive(FileId::new(2), 2, 20);
        stats.increase_deletions(FileId::new(2), 1);
        let total = stats.all();
        assert_eq!(total.number_alive, 3);
        assert_eq!(total.size_alive, 30);
        assert_eq!(total.number_deletions, 1);
    }

    #[test]
    fn test_remove_drops_container() {
        let stats = DatafileStatistics::new();
        stats.create(FileId::new(1));
        assert_eq!(stats.len(), 1);
        stats.remove(FileId::new(1));
        assert!(stats.is_empty());
    }
}
