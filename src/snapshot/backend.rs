//! Subvolume backend abstraction
//!
//! The snapshot manager drives the filesystem exclusively through this trait.
//! All methods are blocking and are called from `spawn_blocking` threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::BackendKind;
use crate::error::Result;

use super::btrfs::BtrfsBackend;
use super::plain::PlainBackend;

/// Filesystem operations needed to manage COW volumes
pub trait SubvolumeBackend: Send + Sync {
    /// Backend identifier, written into every transfer stream
    fn kind(&self) -> BackendKind;

    /// Verify that `root` supports the snapshot operations below.
    /// Fails with `StorageUnavailable` when it does not.
    fn check_pool(&self, root: &Path) -> Result<()>;

    /// Create an empty writable subvolume at `path`
    fn create(&self, path: &Path) -> Result<()>;

    /// Snapshot `source` into `dest`
    fn snapshot(&self, source: &Path, dest: &Path, readonly: bool) -> Result<()>;

    /// Delete a subvolume or snapshot. Missing paths are not an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Opaque value that changes whenever the content at `path` changes
    fn fingerprint(&self, path: &Path) -> Result<String>;

    /// The value [`fingerprint`](Self::fingerprint) gives the source of the
    /// read-only `snapshot` for as long as that source has not been written
    /// since the snapshot was taken. Derived from the snapshot alone.
    fn sealed_fingerprint(&self, snapshot: &Path) -> Result<String>;

    /// Serialize `snapshot`, as a diff against `parent` when given
    fn send(&self, snapshot: &Path, parent: Option<&Path>) -> Result<Vec<u8>>;

    /// Materialize a payload produced by [`send`](Self::send) as the
    /// read-only snapshot `<staging>/<name>` and return its path.
    /// `parent` is the local copy of the diff base, if the payload is a diff.
    fn receive(
        &self,
        payload: &[u8],
        parent: Option<&Path>,
        staging: &Path,
        name: &str,
    ) -> Result<PathBuf>;
}

/// Construct the backend for a configured kind
pub fn backend_for(kind: BackendKind) -> Arc<dyn SubvolumeBackend> {
    match kind {
        BackendKind::Btrfs => Arc::new(BtrfsBackend::new()),
        BackendKind::Plain => Arc::new(PlainBackend::new()),
    }
}
