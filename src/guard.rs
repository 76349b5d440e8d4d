//! Storage Guard
//!
//! Serializes startup work on one storage pool across processes. The pool is
//! validated and the catalog created while holding an exclusive advisory lock
//! on `<root>/.wolfvol.lock`. The lock is released when [`StorageGuard`] is
//! dropped, and by the kernel if the process dies while holding it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::snapshot::{StorageLayout, SubvolumeBackend};

/// Lock file name inside the storage root
const LOCK_FILE: &str = ".wolfvol.lock";

/// Poll interval while waiting for a contended lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive lock on a storage pool. Released on drop.
pub struct StorageGuard {
    file: File,
    path: PathBuf,
}

impl StorageGuard {
    /// Acquire the pool lock.
    ///
    /// With `timeout = None` this blocks until the lock is free. Otherwise it
    /// polls and fails with [`Error::Timeout`] once the bound is exceeded.
    pub fn acquire(root: &Path, timeout: Option<Duration>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match timeout {
            None => file.lock_exclusive()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                            if Instant::now() >= deadline {
                                return Err(Error::Timeout(format!(
                                    "storage lock {} not acquired within {:?}",
                                    path.display(),
                                    timeout
                                )));
                            }
                            std::thread::sleep(LOCK_POLL_INTERVAL);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        debug!("Acquired storage lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageGuard {
    fn drop(&mut self) {
        // Unlock errors are ignored; closing the descriptor releases the lock anyway.
        let _ = self.file.unlock();
        debug!("Released storage lock {}", self.path.display());
    }
}

/// Startup sequence for a storage pool.
///
/// Under the pool lock: check that the backend can snapshot the pool, create
/// the directory layout and open (creating on first start) the catalog.
/// Blocking; call from a blocking thread.
pub fn initialize(
    layout: &StorageLayout,
    backend: &dyn SubvolumeBackend,
    catalog_path: &Path,
    timeout: Option<Duration>,
) -> Result<Catalog> {
    let _guard = StorageGuard::acquire(layout.root(), timeout)?;

    backend.check_pool(layout.root()).map_err(|e| match e {
        Error::StorageUnavailable(_) => e,
        other => Error::StorageUnavailable(other.to_string()),
    })?;

    layout.ensure_dirs()?;
    let catalog = Catalog::open(catalog_path, layout.clone())?;

    info!(
        "Storage pool {} ready ({} backend)",
        layout.root().display(),
        backend.kind()
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PlainBackend;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_times_out() {
        let dir = tempdir().unwrap();
        let held = StorageGuard::acquire(dir.path(), None).unwrap();

        let started = Instant::now();
        let second = StorageGuard::acquire(dir.path(), Some(Duration::from_millis(200)));
        assert!(matches!(second, Err(Error::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(200));

        drop(held);
        assert!(StorageGuard::acquire(dir.path(), Some(Duration::from_millis(200))).is_ok());
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = tempdir().unwrap();

        let failing = || -> Result<()> {
            let _guard = StorageGuard::acquire(dir.path(), None)?;
            Err(Error::Internal("boom".into()))
        };
        assert!(failing().is_err());

        assert!(StorageGuard::acquire(dir.path(), Some(Duration::from_millis(100))).is_ok());
    }

    #[test]
    fn test_initialize_creates_catalog() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        let catalog_path = dir.path().join("catalog.db");

        initialize(&layout, &PlainBackend::new(), &catalog_path, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(catalog_path.exists());
        assert!(layout.volumes_dir().is_dir());

        // Second start reuses the existing catalog
        initialize(&layout, &PlainBackend::new(), &catalog_path, Some(Duration::from_secs(1)))
            .unwrap();
    }

    #[test]
    fn test_initialize_fails_when_pool_missing_capability() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        let catalog_path = dir.path().join("catalog.db");

        let result = initialize(
            &layout,
            &crate::snapshot::BtrfsBackend::with_binary("/nonexistent/btrfs"),
            &catalog_path,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert!(!catalog_path.exists());
    }
}
