//! Named shared segments backed by a file mapping.
//!
//! The first process to map a name creates the file (normally on the
//! `/dev/shm` tmpfs) and sizes it. Later processes open the same file and
//! map it shared, attaching to the region instead of re-creating it. The
//! file outlives every process that mapped it until [`NamedBackend::unlink`]
//! removes it.
//!
//! A creator that fails before initializing the header removes the file
//! again. A creator that dies in that window cannot, and the zero-filled
//! file it leaves is refused by every later attach ("not initialized")
//! until it is unlinked.

use super::{MappedRegion, Release, SegmentBackend};
use crate::error::{StorageError, StorageResult};
use memmap2::MmapOptions;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Backend that maps a named file shared between processes.
#[derive(Debug, Clone)]
pub struct NamedBackend {
    path: PathBuf,
}

impl NamedBackend {
    /// Create a backend for the segment at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the segment file. Processes that still map it keep their view.
    pub fn unlink(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

impl SegmentBackend for NamedBackend {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn map(&self, size: usize) -> StorageResult<MappedRegion> {
        if size == 0 {
            return Err(StorageError::allocation("cannot map zero bytes"));
        }

        let path = self.path.display().to_string();

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                if let Err(e) = file.set_len(size as u64) {
                    let _ = std::fs::remove_file(&self.path);
                    return Err(StorageError::os(format!("resize {}", path), e));
                }
                (file, true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.path)
                    .map_err(|e| StorageError::os(format!("open {}", path), e))?;

                let len = file
                    .metadata()
                    .map_err(|e| StorageError::os(format!("stat {}", path), e))?
                    .len() as usize;

                if len != size {
                    return Err(StorageError::allocation(format!(
                        "segment {} has size {} but {} was requested",
                        path, len, size
                    )));
                }
                (file, false)
            }
            Err(e) => return Err(StorageError::os(format!("create {}", path), e)),
        };

        let mut mmap = match unsafe { MmapOptions::new().len(size).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                if created {
                    let _ = std::fs::remove_file(&self.path);
                }
                return Err(StorageError::os(format!("mmap {}", path), e));
            }
        };

        tracing::info!(path = %path, bytes = size, created, "mapped named segment");

        // Safety: a successful mapping of a non-zero length is never null
        let ptr = unsafe { NonNull::new_unchecked(mmap.as_mut_ptr()) };
        Ok(MappedRegion::new(ptr, size, created, Release::File(mmap)))
    }

    fn discard(&self) {
        match self.unlink() {
            Ok(()) => tracing::info!(path = %self.path.display(), "removed unusable segment"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove unusable segment"
            ),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::backend::page_size;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_attach() {
        let dir = TempDir::new().expect("tempdir");
        let backend = NamedBackend::new(dir.path().join("segment"));

        let first = backend.map(page_size()).expect("create failed");
        assert!(first.created());
        unsafe { std::ptr::write_volatile(first.as_ptr().add(16), 0xAB) };

        let second = backend.map(page_size()).expect("attach failed");
        assert!(!second.created());
        assert_ne!(first.as_ptr(), second.as_ptr());
        assert_eq!(unsafe { std::ptr::read_volatile(second.as_ptr().add(16)) }, 0xAB);
    }

    #[test]
    fn test_attach_size_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let backend = NamedBackend::new(dir.path().join("segment"));

        let _first = backend.map(page_size()).expect("create failed");
        assert!(matches!(
            backend.map(2 * page_size()),
            Err(StorageError::Allocation { .. })
        ));
    }

    #[test]
    fn test_unlink() {
        let dir = TempDir::new().expect("tempdir");
        let backend = NamedBackend::new(dir.path().join("segment"));

        let region = backend.map(page_size()).expect("create failed");
        assert!(backend.path().exists());
        backend.unlink().expect("unlink failed");
        assert!(!backend.path().exists());

        // The existing mapping stays usable
        unsafe { std::ptr::write_volatile(region.as_ptr(), 1) };

        // The next map creates a fresh segment
        assert!(backend.map(page_size()).expect("create failed").created());
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = TempDir::new().expect("tempdir");
        let backend = NamedBackend::new(dir.path().join("segment"));

        drop(backend.map(page_size()).expect("create failed"));
        backend.discard();
        assert!(!backend.path().exists());

        // Nothing left to remove is only logged
        backend.discard();
    }

    #[test]
    fn test_missing_directory_fails() {
        let backend = NamedBackend::new("/nonexistent-shmcache-dir/segment");
        assert!(backend.map(page_size()).is_err());
    }
}
