//! Temporary directories for storage tests.

use std::path::{Path, PathBuf};

/// A temporary directory removed on drop.
///
/// Thin wrapper around `tempfile::TempDir` that survives accidental
/// double-path joins and prints usefully in assertions.
pub struct TestDir {
    inner: tempfile::TempDir,
}

impl TestDir {
    /// Creates a fresh directory.
    ///
    /// # Panics
    ///
    /// Panics when the system temp dir is unusable; acceptable in tests.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self { inner: tempfile::tempdir().expect("create temp dir") }
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// A path below the directory.
    #[must_use]
    pub fn join(&self, name: &str) -> PathBuf {
        self.inner.path().join(name)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
