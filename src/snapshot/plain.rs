//! Plain directory backend
//!
//! Subvolumes are ordinary directories and snapshots are full copies. Streams
//! carry a compressed [`TreeDiff`]. Meant for development machines and tests
//! where no btrfs pool is available.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::BackendKind;
use crate::error::{Error, Result};

use super::backend::SubvolumeBackend;
use super::tree::{self, TreeDiff};

/// Directory-copy backend
#[derive(Debug, Clone, Default)]
pub struct PlainBackend;

impl PlainBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SubvolumeBackend for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
    }

    fn check_pool(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root).map_err(|e| {
            Error::StorageUnavailable(format!("cannot create {}: {}", root.display(), e))
        })?;

        let probe = root.join(format!(".probe-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&probe, b"probe").map_err(|e| {
            Error::StorageUnavailable(format!("{} is not writable: {}", root.display(), e))
        })?;
        fs::remove_file(&probe)?;

        warn!(
            "Plain backend on {}: snapshots are full copies, not copy-on-write",
            root.display()
        );
        Ok(())
    }

    fn create(&self, path: &Path) -> Result<()> {
        fs::create_dir(path)?;
        Ok(())
    }

    /// Copies the tree. Read-only is not enforced on plain directories.
    fn snapshot(&self, source: &Path, dest: &Path, _readonly: bool) -> Result<()> {
        tree::copy_tree(source, dest)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        tree::remove_path(path)
    }

    fn fingerprint(&self, path: &Path) -> Result<String> {
        tree::digest(path)
    }

    fn sealed_fingerprint(&self, snapshot: &Path) -> Result<String> {
        tree::digest(snapshot)
    }

    fn send(&self, snapshot: &Path, parent: Option<&Path>) -> Result<Vec<u8>> {
        TreeDiff::between(parent, snapshot)?.encode()
    }

    fn receive(
        &self,
        payload: &[u8],
        parent: Option<&Path>,
        staging: &Path,
        name: &str,
    ) -> Result<PathBuf> {
        // Decode before touching the disk so garbage leaves nothing behind
        let diff = TreeDiff::decode(payload)?;
        let dest = staging.join(name);

        match parent {
            Some(parent) => tree::copy_tree(parent, &dest)?,
            None => fs::create_dir(&dest)?,
        }

        if let Err(e) = diff.apply(&dest) {
            let _ = tree::remove_path(&dest);
            return Err(e);
        }
        Ok(dest)
    }
}
