//! Byte stores backing datafiles.
//!
//! On Unix, reads go through [`std::os::unix::fs::FileExt::read_exact_at`]:
//! they take `&self`, never touch the file cursor, and need no
//! synchronization. Writes are serialized by a lightweight unit mutex (not
//! wrapping the `File`) to prevent interleaved extensions and torn writes.
//!
//! [`MemoryStore`] serves volatile collections, which keep their datafiles
//! in anonymous memory and lose them on shutdown.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Positional byte-level access under a datafile.
pub trait ByteStore: Send + Sync {
    /// Reads exactly `buf.len()` bytes at the offset.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes all bytes at the offset, extending the store as needed.
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()>;

    /// Flushes written data to durable storage.
    fn sync(&self) -> Result<()>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Whether the store is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// File-backed byte store using positional I/O.
pub struct FileStore {
    file: File,
    /// Serializes writes and file extensions; reads bypass it entirely.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Creates a new file, truncating an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        Ok(Self { file, write_lock: Mutex::new(()) })
    }

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, write_lock: Mutex::new(()) })
    }
}

impl ByteStore for FileStore {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            self.file.read_exact_at(buf, offset)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(Error::Corrupted { reason: "positional reads require unix".to_string() })
        }
    }

    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        #[cfg(unix)]
        {
            self.file.write_all_at(data, offset)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(Error::Corrupted { reason: "positional writes require unix".to_string() })
        }
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// In-memory byte store for volatile collections.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteStore for MemoryStore {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("read past end: {end} > {}", data.len()),
                ),
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_all_at(&self, bytes: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn roundtrip(store: &dyn ByteStore) {
        store.write_all_at(b"hello", 0).unwrap();
        store.write_all_at(b"world", 16).unwrap();
        let mut buf = [0u8; 5];
        store.read_exact_at(&mut buf, 16).unwrap();
        assert_eq!(&buf, b"world");
        store.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(store.len().unwrap(), 21);
    }

    #[test]
    fn test_memory_store_roundtrip() {
        roundtrip(&MemoryStore::new());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("t.db")).unwrap();
        roundtrip(&store);
        store.sync().unwrap();
    }

    #[test]
    fn test_memory_read_past_end_fails() {
        let store = MemoryStore::new();
        store.write_all_at(b"ab", 0).unwrap();
        let mut buf = [0u8; 4];
        assert!(store.read_exact_at(&mut buf, 0).is_err());
    }

    #[test]
    fn test_file_reopen_sees_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let store = FileStore::create(&path).unwrap();
            store.write_all_at(b"persist", 8).unwrap();
            store.sync().unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        let mut buf = [0u8; 7];
        store.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(&buf, b"persist");
    }
}
