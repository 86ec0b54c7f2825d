//! A single append-only datafile.
//!
//! Datafiles move through a fixed lifecycle: created as `temp-<fid>.db`,
//! renamed to `journal-<fid>.db` while they are the active append target,
//! and renamed to `datafile-<fid>.db` once sealed. Compactor files keep the
//! `compaction-<fid>.db` name for their whole life.
//!
//! The `written` and `synced` cursors are atomics: the journal is appended
//! under the owning store's files lock while replication readers scan it
//! under the shared side of that lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use arbor_types::{FileId, Tick, encode};

use crate::FORMAT_VERSION;
use crate::backend::{ByteStore, FileStore, MemoryStore};
use crate::error::{Error, Result};
use crate::marker::{
    DatafileHeaderPayload, MARKER_HEADER_SIZE, MarkerHeader, MarkerType, align8, decode_header,
    encode_marker, verify_crc,
};

/// Space kept free at the end of every datafile for the footer marker.
const FOOTER_RESERVE: u64 = 64;

/// Lifecycle state of a datafile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatafileState {
    /// Open for appends.
    Open = 0,
    /// Footer written; read-only from here on.
    Sealed = 1,
    /// A write or sync failed; the file is read-only and suspect.
    WriteError = 2,
}

/// One append-only datafile.
pub struct Datafile {
    fid: FileId,
    store: Box<dyn ByteStore>,
    path: Mutex<Option<PathBuf>>,
    maximal_size: u64,
    state: AtomicU8,
    /// Next free offset (everything below is valid marker data).
    written: AtomicU64,
    /// Offset up to which data has been fsynced.
    synced: AtomicU64,
    data_min: AtomicU64,
    data_max: AtomicU64,
    tick_min: AtomicU64,
    tick_max: AtomicU64,
}

impl Datafile {
    /// Creates a new physical datafile at `path` and writes its header
    /// marker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or written.
    pub fn create(path: &Path, fid: FileId, maximal_size: u64, tick: Tick) -> Result<Self> {
        let store = Box::new(FileStore::create(path)?);
        Self::init(store, Some(path.to_path_buf()), fid, maximal_size, tick)
    }

    /// Creates a new in-memory datafile (volatile collections).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing the header marker fails.
    pub fn create_in_memory(fid: FileId, maximal_size: u64, tick: Tick) -> Result<Self> {
        Self::init(Box::new(MemoryStore::new()), None, fid, maximal_size, tick)
    }

    fn init(
        store: Box<dyn ByteStore>,
        path: Option<PathBuf>,
        fid: FileId,
        maximal_size: u64,
        tick: Tick,
    ) -> Result<Self> {
        let datafile = Self {
            fid,
            store,
            path: Mutex::new(path),
            maximal_size,
            state: AtomicU8::new(DatafileState::Open as u8),
            written: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            data_min: AtomicU64::new(0),
            data_max: AtomicU64::new(0),
            tick_min: AtomicU64::new(0),
            tick_max: AtomicU64::new(0),
        };
        let payload = encode(&DatafileHeaderPayload {
            version: FORMAT_VERSION,
            maximal_size,
            fid: fid.value(),
        })?;
        datafile.append_marker(MarkerType::DatafileHeader, tick, &payload)?;
        Ok(datafile)
    }

    /// Opens an existing physical datafile and scans it to find the end of
    /// valid data.
    ///
    /// The scan stops at the first torn marker (zero size or checksum
    /// mismatch), which recovers partially written tails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub fn open(path: &Path, fid: FileId, maximal_size: u64) -> Result<Self> {
        let store = Box::new(FileStore::open(path)?);
        let datafile = Self {
            fid,
            store,
            path: Mutex::new(Some(path.to_path_buf())),
            maximal_size,
            state: AtomicU8::new(DatafileState::Open as u8),
            written: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            data_min: AtomicU64::new(0),
            data_max: AtomicU64::new(0),
            tick_min: AtomicU64::new(0),
            tick_max: AtomicU64::new(0),
        };
        let mut sealed = false;
        let end = datafile.scan(&mut sealed)?;
        datafile.written.store(end, Ordering::SeqCst);
        datafile.synced.store(end, Ordering::SeqCst);
        if sealed {
            datafile.state.store(DatafileState::Sealed as u8, Ordering::SeqCst);
        }
        Ok(datafile)
    }

    /// Walks all markers, updating tick summaries; returns the end offset.
    fn scan(&self, sealed: &mut bool) -> Result<u64> {
        let len = self.store.len()?;
        let mut offset = 0u64;
        while offset + MARKER_HEADER_SIZE as u64 <= len {
            let mut head = [0u8; MARKER_HEADER_SIZE];
            self.store.read_exact_at(&mut head, offset)?;
            let size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            if size == 0 {
                break;
            }
            let Ok(header) = decode_header(&head) else { break };
            if offset + header.aligned_size() > len {
                break;
            }
            let mut marker = vec![0u8; header.size as usize];
            self.store.read_exact_at(&mut marker, offset)?;
            if !verify_crc(&marker, &header) {
                break;
            }
            self.note_tick(header.tick, header.marker_type.is_data());
            if header.marker_type == MarkerType::Footer {
                *sealed = true;
            }
            offset += header.aligned_size();
        }
        Ok(offset)
    }

    /// The file id.
    #[must_use]
    pub fn fid(&self) -> FileId {
        self.fid
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DatafileState {
        match self.state.load(Ordering::SeqCst) {
            0 => DatafileState::Open,
            1 => DatafileState::Sealed,
            _ => DatafileState::WriteError,
        }
    }

    /// Whether the footer has been written.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state() == DatafileState::Sealed
    }

    /// Whether the file lives on disk (as opposed to anonymous memory).
    #[must_use]
    pub fn is_physical(&self) -> bool {
        self.path.lock().is_some()
    }

    /// Current on-disk path, if physical.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// End of valid data (the append cursor).
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Offset up to which data is known durable.
    #[must_use]
    pub fn synced(&self) -> u64 {
        self.synced.load(Ordering::SeqCst)
    }

    /// Lowest data-marker tick seen, 0 when none.
    #[must_use]
    pub fn data_min(&self) -> u64 {
        self.data_min.load(Ordering::SeqCst)
    }

    /// Highest data-marker tick seen, 0 when none.
    #[must_use]
    pub fn data_max(&self) -> u64 {
        self.data_max.load(Ordering::SeqCst)
    }

    /// Highest tick of any marker.
    #[must_use]
    pub fn tick_max(&self) -> u64 {
        self.tick_max.load(Ordering::SeqCst)
    }

    /// Whether the data range `[data_min, data_max]` overlaps the request.
    #[must_use]
    pub fn overlaps(&self, data_min: u64, data_max: u64) -> bool {
        let own_min = self.data_min();
        let own_max = self.data_max();
        if own_min == 0 || own_max == 0 {
            return false;
        }
        data_max >= own_min && data_min <= own_max
    }

    /// Reserves space for a marker of `size` bytes (pre-alignment).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatafileFull`] when the aligned marker plus footer
    /// reserve does not fit, [`Error::DatafileSealed`] when the file is no
    /// longer open.
    pub fn reserve_element(&self, size: u64) -> Result<u64> {
        if self.state() != DatafileState::Open {
            return Err(Error::DatafileSealed { fid: self.fid.value() });
        }
        let aligned = align8(size);
        let offset = self.written.load(Ordering::SeqCst);
        if offset + aligned + FOOTER_RESERVE > self.maximal_size {
            return Err(Error::DatafileFull);
        }
        self.written.store(offset + aligned, Ordering::SeqCst);
        Ok(offset)
    }

    /// Writes a pre-encoded marker at a reserved offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the underlying write fails; the file is
    /// then marked [`DatafileState::WriteError`].
    pub fn write_reserved(&self, offset: u64, marker: &[u8], tick: Tick, is_data: bool) -> Result<()> {
        if let Err(e) = self.store.write_all_at(marker, offset) {
            self.state.store(DatafileState::WriteError as u8, Ordering::SeqCst);
            return Err(e);
        }
        self.note_tick(tick, is_data);
        Ok(())
    }

    /// Encodes, reserves and writes a marker in one step.
    ///
    /// Returns the offset of the marker.
    ///
    /// # Errors
    ///
    /// Propagates reservation and write errors.
    pub fn append_marker(&self, marker_type: MarkerType, tick: Tick, payload: &[u8]) -> Result<u64> {
        let marker = encode_marker(marker_type, tick, payload);
        let offset = self.reserve_element((MARKER_HEADER_SIZE + payload.len()) as u64)?;
        self.write_reserved(offset, &marker, tick, marker_type.is_data())?;
        Ok(offset)
    }

    fn note_tick(&self, tick: Tick, is_data: bool) {
        let value = tick.value();
        if value == 0 {
            return;
        }
        if self.tick_min.load(Ordering::SeqCst) == 0 {
            self.tick_min.store(value, Ordering::SeqCst);
        }
        self.tick_max.fetch_max(value, Ordering::SeqCst);
        if is_data {
            if self.data_min.load(Ordering::SeqCst) == 0 {
                self.data_min.store(value, Ordering::SeqCst);
            }
            self.data_max.fetch_max(value, Ordering::SeqCst);
        }
    }

    /// Flushes appended data, advancing the synced cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on fsync failure; the file is then marked
    /// [`DatafileState::WriteError`].
    pub fn sync(&self) -> Result<()> {
        let written = self.written.load(Ordering::SeqCst);
        if self.synced.load(Ordering::SeqCst) >= written {
            return Ok(());
        }
        if let Err(e) = self.store.sync() {
            self.state.store(DatafileState::WriteError as u8, Ordering::SeqCst);
            return Err(e);
        }
        self.synced.store(written, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the footer marker, fsyncs and marks the file sealed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatafileSealed`] when already sealed, or the
    /// underlying write/sync error.
    pub fn seal(&self, tick: Tick) -> Result<()> {
        if self.state() != DatafileState::Open {
            return Err(Error::DatafileSealed { fid: self.fid.value() });
        }
        let marker = encode_marker(MarkerType::Footer, tick, &[]);
        let offset = self.written.load(Ordering::SeqCst);
        self.store.write_all_at(&marker, offset)?;
        self.written.store(offset + align8(marker.len() as u64), Ordering::SeqCst);
        self.sync()?;
        self.state.store(DatafileState::Sealed as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Renames the physical file; in-memory files ignore the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the filesystem rename fails.
    pub fn rename(&self, new_path: PathBuf) -> Result<()> {
        let mut path = self.path.lock();
        if let Some(current) = path.as_ref() {
            std::fs::rename(current, &new_path)?;
            *path = Some(new_path);
        }
        Ok(())
    }

    /// Reads the marker at `offset`.
    ///
    /// Returns `None` at end of data (cursor reached, zero size, or torn
    /// tail).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on a checksum mismatch below the append
    /// cursor.
    pub fn read_marker_at(&self, offset: u64) -> Result<Option<(MarkerHeader, Vec<u8>)>> {
        let end = self.written.load(Ordering::SeqCst);
        if offset + MARKER_HEADER_SIZE as u64 > end {
            return Ok(None);
        }
        let mut head = [0u8; MARKER_HEADER_SIZE];
        self.store.read_exact_at(&mut head, offset)?;
        let size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if size == 0 {
            return Ok(None);
        }
        let header = decode_header(&head)?;
        if offset + u64::from(header.size) > end {
            return Ok(None);
        }
        let mut marker = vec![0u8; header.size as usize];
        self.store.read_exact_at(&mut marker, offset)?;
        if !verify_crc(&marker, &header) {
            return Err(Error::Corrupted {
                reason: format!("checksum mismatch in file {} at offset {offset}", self.fid),
            });
        }
        let payload = marker.split_off(MARKER_HEADER_SIZE);
        Ok(Some((header, payload)))
    }

    /// Reads `len` payload bytes at `offset` (revision-cache dereference).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the read fails.
    pub fn read_payload(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.store.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Iterates all markers in order.
    ///
    /// The callback receives the marker header, its payload and the payload's
    /// file offset; returning `false` stops iteration early.
    ///
    /// # Errors
    ///
    /// Propagates read and checksum errors.
    pub fn iterate<F>(&self, mut cb: F) -> Result<bool>
    where
        F: FnMut(&MarkerHeader, &[u8], u64) -> bool,
    {
        let mut offset = 0u64;
        while let Some((header, payload)) = self.read_marker_at(offset)? {
            let payload_offset = offset + MARKER_HEADER_SIZE as u64;
            if !cb(&header, &payload, payload_offset) {
                return Ok(false);
            }
            offset += header.aligned_size();
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Datafile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datafile")
            .field("fid", &self.fid)
            .field("state", &self.state())
            .field("written", &self.written())
            .field("path", &self.path())
            .finish()
    }
}
