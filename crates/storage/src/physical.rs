//! The physical storage backend of a collection.
//!
//! [`StorageBackend`] is the capability surface the logical collection
//! consumes: append, seal, iterate, lookup. [`AppendStore`] is the
//! append-only implementor described here; alternative engines implement
//! the same trait.
//!
//! An `AppendStore` owns three file vectors behind one read-write lock:
//! `datafiles` (sealed, append-ordered by fid), `journals` (at most one
//! open append target) and `compactors` (at most one merge target). A
//! separate queuing compaction gate lets long-running readers exclude the
//! compactor without starving it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use arbor_types::{CollectionId, FileId, RevisionId, Tick, encode};

use crate::datafile::Datafile;
use crate::error::{Error, Result};
use crate::marker::{ColHeaderPayload, MARKER_HEADER_SIZE, MarkerHeader, MarkerType, encode_marker};
use crate::revision_cache::{DocumentPosition, RevisionCache};
use crate::stats::DatafileStatistics;

/// Slack subtracted from the target size when sizing a journal for a
/// marker.
const JOURNAL_OVERHEAD: u64 = 256;

/// Result of appending a marker.
#[derive(Debug, Clone, Copy)]
pub struct AppendResult {
    /// File that received the marker.
    pub fid: FileId,
    /// Offset of the marker payload inside the file.
    pub payload_offset: u64,
    /// Payload length in bytes.
    pub payload_len: u32,
}

/// Capability surface of a physical collection store.
pub trait StorageBackend: Send + Sync {
    /// The owning collection id.
    fn cid(&self) -> CollectionId;

    /// Appends a marker to the active journal, rotating as needed.
    ///
    /// # Errors
    ///
    /// Surfaces reservation and write errors; [`Error::DatafileFull`] is
    /// consumed internally by rotation.
    fn append_marker(&self, marker_type: MarkerType, tick: Tick, payload: &[u8])
    -> Result<AppendResult>;

    /// Fsyncs the active journal up to its append cursor.
    ///
    /// # Errors
    ///
    /// Surfaces the fsync failure; the journal is marked write-errored.
    fn sync_active_journal(&self) -> Result<()>;

    /// Seals the active journal and moves it to the datafiles vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoJournal`] when no journal is open.
    fn rotate_active_journal(&self) -> Result<()>;

    /// Dereferences a document position to its payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRevision`]-adjacent corruption errors when
    /// the owning file is gone.
    fn read_document(&self, position: &DocumentPosition) -> Result<Vec<u8>>;

    /// The revision cache.
    fn revision_cache(&self) -> &RevisionCache;

    /// The per-datafile statistics.
    fn statistics(&self) -> &DatafileStatistics;

    /// High-water revision of the collection.
    fn last_revision(&self) -> RevisionId;

    /// Raises (or with `force` overwrites) the high-water revision.
    fn set_last_revision(&self, revision: RevisionId, force: bool);

    /// Applies `cb` to every document/remove marker with tick in
    /// `(data_min, data_max]`, in file order.
    ///
    /// Returns `has_more`: true when the callback aborted the iteration
    /// early, false when the range was exhausted.
    ///
    /// # Errors
    ///
    /// Surfaces read errors from the underlying files.
    fn apply_for_tick_range(
        &self,
        data_min: u64,
        data_max: u64,
        cb: &mut dyn FnMut(Tick, &MarkerHeader, &[u8]) -> bool,
    ) -> Result<bool>;

    /// Iterates every marker of every file (datafiles, journals,
    /// compactors) in ascending fid order. Recovery driver.
    ///
    /// # Errors
    ///
    /// Propagates the first error the callback returns.
    fn iterate_on_load(
        &self,
        cb: &mut dyn FnMut(FileId, &MarkerHeader, &[u8], u64) -> Result<()>,
    ) -> Result<()>;

    /// Allocates the compactor file for merging the datafile with the same
    /// fid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] when a compactor already exists.
    fn create_compactor(&self, fid: FileId, maximal_size: u64) -> Result<Arc<Datafile>>;

    /// Seals the compactor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoJournal`] when no (or a different) compactor is
    /// present.
    fn close_compactor(&self, fid: FileId) -> Result<()>;

    /// Atomically swaps the compactor into the datafiles vector at the old
    /// file's position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] when the datafile or compactor cannot
    /// be found.
    fn replace_datafile_with_compactor(&self, fid: FileId) -> Result<()>;

    /// Removes a datafile from the set. Returns whether it was present.
    fn remove_datafile(&self, fid: FileId) -> bool;

    /// Removes a compactor from the set. Returns whether it was present.
    fn remove_compactor(&self, fid: FileId) -> bool;

    /// Excludes the compactor for the caller's read window.
    fn prevent_compaction(&self);

    /// Non-blocking [`StorageBackend::prevent_compaction`].
    fn try_prevent_compaction(&self) -> bool;

    /// Releases a `prevent_compaction` window.
    fn allow_compaction(&self);

    /// The compactor's exclusive entry.
    fn lock_for_compaction(&self);

    /// Non-blocking [`StorageBackend::lock_for_compaction`].
    fn try_lock_for_compaction(&self) -> bool;

    /// Releases the compactor's exclusive lock.
    fn finish_compaction(&self);

    /// Number of open journals (0 or 1).
    fn journal_count(&self) -> usize;

    /// Number of sealed datafiles.
    fn datafile_count(&self) -> usize;

    /// Number of compactors (0 or 1).
    fn compactor_count(&self) -> usize;

    /// Closes all files and clears the cache.
    fn close(&self);
}

/// Queuing read-write gate for compaction exclusion.
///
/// A waiting compactor blocks new preventers, so a stream of short readers
/// cannot starve it.
#[derive(Default)]
struct CompactionGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

impl CompactionGate {
    fn read_lock(&self) {
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    fn try_read_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.writers_waiting > 0 {
            return false;
        }
        state.readers += 1;
        true
    }

    fn read_unlock(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    fn write_lock(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
    }

    fn try_write_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    fn write_unlock(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }
}

/// The file vectors, all protected by one lock.
#[derive(Default)]
struct FileVectors {
    datafiles: Vec<Arc<Datafile>>,
    journals: Vec<Arc<Datafile>>,
    compactors: Vec<Arc<Datafile>>,
}

/// The append-only physical store.
pub struct AppendStore {
    cid: CollectionId,
    path: Option<PathBuf>,
    journal_size: u64,
    files: RwLock<FileVectors>,
    compaction: CompactionGate,
    cache: RevisionCache,
    stats: DatafileStatistics,
    last_revision: AtomicU64,
    last_fid: AtomicU64,
}

impl AppendStore {
    /// Creates a store writing to `path`; `None` keeps all files in memory
    /// (volatile collections).
    #[must_use]
    pub fn new(cid: CollectionId, path: Option<PathBuf>, journal_size: u64) -> Self {
        Self {
            cid,
            path,
            journal_size,
            files: RwLock::new(FileVectors::default()),
            compaction: CompactionGate::default(),
            cache: RevisionCache::new(),
            stats: DatafileStatistics::new(),
            last_revision: AtomicU64::new(0),
            last_fid: AtomicU64::new(0),
        }
    }

    /// Opens a store over existing datafiles found under `path`.
    ///
    /// Recognizes `datafile-<fid>.db`, `journal-<fid>.db` and
    /// `compaction-<fid>.db`; anything else is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the directory cannot be read or a file
    /// cannot be opened.
    pub fn open(cid: CollectionId, path: PathBuf, journal_size: u64) -> Result<Self> {
        let store = Self::new(cid, Some(path.clone()), journal_size);
        let mut entries: Vec<(String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                entries.push((name.to_string(), entry.path()));
            }
        }
        entries.sort();
        let mut files = store.files.write();
        for (name, file_path) in entries {
            let Some((kind, fid)) = parse_datafile_name(&name) else { continue };
            let datafile = Arc::new(Datafile::open(&file_path, fid, journal_size)?);
            store.stats.create(fid);
            store.last_fid.fetch_max(fid.value(), Ordering::SeqCst);
            match kind {
                FileKind::Datafile => files.datafiles.push(datafile),
                FileKind::Journal => files.journals.push(datafile),
                FileKind::Compactor => files.compactors.push(datafile),
            }
        }
        files.datafiles.sort_by_key(|d| d.fid());
        drop(files);
        Ok(store)
    }

    fn next_fid(&self, tick: Tick) -> FileId {
        let mut current = self.last_fid.load(Ordering::SeqCst);
        loop {
            let candidate = tick.value().max(current + 1);
            match self.last_fid.compare_exchange(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return FileId::new(candidate),
                Err(observed) => current = observed,
            }
        }
    }

    /// Creates a datafile (journal or compactor), writing its header and
    /// collection-header markers.
    fn create_datafile(&self, fid: FileId, size: u64, is_compactor: bool) -> Result<Arc<Datafile>> {
        self.stats.create(fid);
        let tick = Tick::new(fid.value());
        let datafile = match &self.path {
            None => Datafile::create_in_memory(fid, size, tick)?,
            Some(dir) => {
                let prefix = if is_compactor { "compaction" } else { "temp" };
                let temp_path = dir.join(format!("{prefix}-{fid}.db"));
                if temp_path.exists() {
                    std::fs::remove_file(&temp_path)?;
                }
                Datafile::create(&temp_path, fid, size, tick)?
            },
        };
        let payload = encode(&ColHeaderPayload { cid: self.cid.value() })?;
        datafile.append_marker(MarkerType::ColHeader, tick, &payload)?;
        if !is_compactor && datafile.is_physical() {
            let journal_path = self
                .path
                .as_ref()
                .map(|dir| dir.join(format!("journal-{fid}.db")))
                .unwrap_or_default();
            datafile.rename(journal_path)?;
            tracing::trace!(fid = %fid, "created new journal");
        } else {
            tracing::trace!(fid = %fid, compactor = is_compactor, "created new datafile");
        }
        Ok(Arc::new(datafile))
    }

    /// Seals a datafile; non-compactors are renamed to their sealed name.
    fn seal_datafile(&self, datafile: &Datafile, is_compactor: bool) -> Result<()> {
        let tick = Tick::new(self.last_revision.load(Ordering::SeqCst).max(datafile.tick_max()));
        datafile.seal(tick)?;
        if !is_compactor && datafile.is_physical() {
            if let Some(dir) = &self.path {
                let sealed = dir.join(format!("datafile-{}.db", datafile.fid()));
                if let Err(e) = datafile.rename(sealed) {
                    // The file stays usable under its journal name.
                    tracing::error!(fid = %datafile.fid(), error = %e, "failed to rename sealed journal");
                }
            }
        }
        Ok(())
    }

    /// Reserves journal space for a marker of `size` bytes, rotating the
    /// journal as needed.
    ///
    /// # Errors
    ///
    /// Surfaces creation, seal and reservation errors other than
    /// [`Error::DatafileFull`], which drives rotation.
    pub fn reserve_journal_space(&self, tick: Tick, size: u64) -> Result<(Arc<Datafile>, u64)> {
        let mut target_size = self.journal_size;
        while target_size.saturating_sub(JOURNAL_OVERHEAD) < size {
            target_size *= 2;
        }

        let mut files = self.files.write();
        loop {
            if files.journals.is_empty() {
                let fid = self.next_fid(tick);
                let journal = self.create_datafile(fid, target_size, false)?;
                files.journals.push(journal);
            }
            let journal = files.journals[0].clone();
            match journal.reserve_element(size) {
                Ok(offset) => return Ok((journal, offset)),
                Err(Error::DatafileFull) => {
                    tracing::debug!(fid = %journal.fid(), "closing full journal");
                    self.seal_datafile(&journal, false)?;
                    files.datafiles.push(journal);
                    files.journals.clear();
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn find_file(&self, fid: FileId) -> Option<Arc<Datafile>> {
        let files = self.files.read();
        files
            .datafiles
            .iter()
            .chain(files.journals.iter())
            .chain(files.compactors.iter())
            .find(|d| d.fid() == fid)
            .cloned()
    }
}

impl StorageBackend for AppendStore {
    fn cid(&self) -> CollectionId {
        self.cid
    }

    fn append_marker(
        &self,
        marker_type: MarkerType,
        tick: Tick,
        payload: &[u8],
    ) -> Result<AppendResult> {
        let marker = encode_marker(marker_type, tick, payload);
        let size = (MARKER_HEADER_SIZE + payload.len()) as u64;
        let (journal, offset) = self.reserve_journal_space(tick, size)?;
        journal.write_reserved(offset, &marker, tick, marker_type.is_data())?;
        Ok(AppendResult {
            fid: journal.fid(),
            payload_offset: offset + MARKER_HEADER_SIZE as u64,
            payload_len: payload.len() as u32,
        })
    }

    fn sync_active_journal(&self) -> Result<()> {
        let journal = {
            let files = self.files.read();
            files.journals.first().cloned()
        };
        match journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn rotate_active_journal(&self) -> Result<()> {
        let mut files = self.files.write();
        let Some(journal) = files.journals.first().cloned() else {
            return Err(Error::NoJournal);
        };
        self.seal_datafile(&journal, false)?;
        files.datafiles.push(journal);
        files.journals.clear();
        Ok(())
    }

    fn read_document(&self, position: &DocumentPosition) -> Result<Vec<u8>> {
        match position {
            DocumentPosition::Wal { data } => Ok(data.to_vec()),
            DocumentPosition::File { fid, offset, len } => {
                let datafile = self.find_file(*fid).ok_or_else(|| Error::Corrupted {
                    reason: format!("document position references missing file {fid}"),
                })?;
                datafile.read_payload(*offset, *len as usize)
            },
        }
    }

    fn revision_cache(&self) -> &RevisionCache {
        &self.cache
    }

    fn statistics(&self) -> &DatafileStatistics {
        &self.stats
    }

    fn last_revision(&self) -> RevisionId {
        RevisionId::new(self.last_revision.load(Ordering::SeqCst))
    }

    fn set_last_revision(&self, revision: RevisionId, force: bool) {
        if force {
            self.last_revision.store(revision.value(), Ordering::SeqCst);
        } else {
            self.last_revision.fetch_max(revision.value(), Ordering::SeqCst);
        }
    }

    fn apply_for_tick_range(
        &self,
        data_min: u64,
        data_max: u64,
        cb: &mut dyn FnMut(Tick, &MarkerHeader, &[u8]) -> bool,
    ) -> Result<bool> {
        struct Candidate {
            datafile: Arc<Datafile>,
            tick_max: u64,
            is_journal: bool,
        }

        let candidates: Vec<Candidate> = {
            let files = self.files.read();
            let sealed = files.datafiles.iter().map(|d| (d.clone(), false));
            let journals = files.journals.iter().map(|d| (d.clone(), true));
            sealed
                .chain(journals)
                .filter(|(d, _)| d.overlaps(data_min, data_max))
                .map(|(datafile, is_journal)| Candidate {
                    tick_max: datafile.tick_max(),
                    datafile,
                    is_journal,
                })
                .collect()
        };

        let n = candidates.len();
        for (i, candidate) in candidates.iter().enumerate() {
            // A journal may be appended concurrently; hold the files lock
            // shared while scanning it.
            let _journal_guard = candidate.is_journal.then(|| self.files.read());
            let is_last = i + 1 == n;

            let mut offset = 0u64;
            while let Some((header, payload)) = candidate.datafile.read_marker_at(offset)? {
                offset += header.aligned_size();
                if header.marker_type == MarkerType::Blank {
                    continue;
                }
                let tick = header.tick.value();
                if tick <= data_min {
                    continue;
                }
                if tick > data_max {
                    return Ok(false);
                }
                if !header.marker_type.is_data() {
                    if tick >= data_max || (tick > candidate.tick_max && is_last) {
                        return Ok(false);
                    }
                    continue;
                }
                let proceed = cb(header.tick, &header, &payload);
                if tick >= data_max || (tick >= candidate.tick_max && is_last) {
                    return Ok(false);
                }
                if !proceed {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn iterate_on_load(
        &self,
        cb: &mut dyn FnMut(FileId, &MarkerHeader, &[u8], u64) -> Result<()>,
    ) -> Result<()> {
        let mut all: Vec<Arc<Datafile>> = {
            let files = self.files.read();
            files
                .datafiles
                .iter()
                .chain(files.journals.iter())
                .chain(files.compactors.iter())
                .cloned()
                .collect()
        };
        all.sort_by_key(|d| d.fid());
        for datafile in all {
            let fid = datafile.fid();
            let mut failure: Option<Error> = None;
            datafile.iterate(|header, payload, payload_offset| {
                match cb(fid, header, payload, payload_offset) {
                    Ok(()) => true,
                    Err(e) => {
                        failure = Some(e);
                        false
                    },
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(())
    }

    fn create_compactor(&self, fid: FileId, maximal_size: u64) -> Result<Arc<Datafile>> {
        let mut files = self.files.write();
        if !files.compactors.is_empty() {
            return Err(Error::Corrupted { reason: "a compactor already exists".to_string() });
        }
        let compactor = self.create_datafile(fid, maximal_size, true)?;
        files.compactors.push(compactor.clone());
        Ok(compactor)
    }

    fn close_compactor(&self, fid: FileId) -> Result<()> {
        let files = self.files.write();
        match files.compactors.first() {
            Some(compactor) if compactor.fid() == fid => self.seal_datafile(compactor, true),
            _ => Err(Error::NoJournal),
        }
    }

    fn replace_datafile_with_compactor(&self, fid: FileId) -> Result<()> {
        let mut files = self.files.write();
        let Some(compactor) = files.compactors.first().cloned() else {
            return Err(Error::Corrupted { reason: "no compactor to swap in".to_string() });
        };
        if compactor.fid() != fid {
            return Err(Error::Corrupted {
                reason: format!("compactor fid {} does not match {fid}", compactor.fid()),
            });
        }
        let Some(position) = files.datafiles.iter().position(|d| d.fid() == fid) else {
            return Err(Error::Corrupted { reason: format!("no datafile with fid {fid}") });
        };
        files.datafiles[position] = compactor;
        files.compactors.clear();
        Ok(())
    }

    fn remove_datafile(&self, fid: FileId) -> bool {
        let mut files = self.files.write();
        let before = files.datafiles.len();
        files.datafiles.retain(|d| d.fid() != fid);
        before != files.datafiles.len()
    }

    fn remove_compactor(&self, fid: FileId) -> bool {
        let mut files = self.files.write();
        let before = files.compactors.len();
        files.compactors.retain(|d| d.fid() != fid);
        before != files.compactors.len()
    }

    fn prevent_compaction(&self) {
        self.compaction.read_lock();
    }

    fn try_prevent_compaction(&self) -> bool {
        self.compaction.try_read_lock()
    }

    fn allow_compaction(&self) {
        self.compaction.read_unlock();
    }

    fn lock_for_compaction(&self) {
        self.compaction.write_lock();
    }

    fn try_lock_for_compaction(&self) -> bool {
        self.compaction.try_write_lock()
    }

    fn finish_compaction(&self) {
        self.compaction.write_unlock();
    }

    fn journal_count(&self) -> usize {
        self.files.read().journals.len()
    }

    fn datafile_count(&self) -> usize {
        self.files.read().datafiles.len()
    }

    fn compactor_count(&self) -> usize {
        self.files.read().compactors.len()
    }

    fn close(&self) {
        let mut files = self.files.write();
        files.datafiles.clear();
        files.journals.clear();
        files.compactors.clear();
        self.cache.clear();
        self.last_revision.store(0, Ordering::SeqCst);
    }
}

enum FileKind {
    Datafile,
    Journal,
    Compactor,
}

fn parse_datafile_name(name: &str) -> Option<(FileKind, FileId)> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix("datafile-") {
        (FileKind::Datafile, rest)
    } else if let Some(rest) = name.strip_prefix("journal-") {
        (FileKind::Journal, rest)
    } else if let Some(rest) = name.strip_prefix("compaction-") {
        (FileKind::Compactor, rest)
    } else {
        return None;
    };
    let fid = rest.strip_suffix(".db")?.parse::<u64>().ok()?;
    Some((kind, FileId::new(fid)))
}
