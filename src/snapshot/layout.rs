//! On-disk layout of a storage pool
//!
//! ```text
//! <root>/volumes/<name>/                        volume storage path
//! <root>/volumes/<name>/live -> subvol-<id>     writable state, swapped atomically
//! <root>/volumes/<name>/subvol-<id>/            writable subvolume
//! <root>/volumes/<name>/snapshots/<token>/      read-only snapshots
//! <root>/volumes/<name>/snapshots/<token>.meta  snapshot metadata
//! <root>/volumes/<name>/staging/<id>/           uncommitted receives
//! ```

use std::path::{Path, PathBuf};

use crate::volume::{SnapshotToken, VolumeName};

/// Name of the symlink pointing at the writable subvolume
pub const LIVE_LINK: &str = "live";

/// Prefix of writable subvolume directories
pub const SUBVOL_PREFIX: &str = "subvol-";

/// Path computations for one storage pool
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// The volume's own storage path
    pub fn volume_dir(&self, name: &VolumeName) -> PathBuf {
        self.volumes_dir().join(name.as_str())
    }

    /// Path containers mount; resolves to the current writable subvolume
    pub fn mountpoint(&self, name: &VolumeName) -> PathBuf {
        self.volume_dir(name).join(LIVE_LINK)
    }

    pub fn snapshots_dir(&self, name: &VolumeName) -> PathBuf {
        self.volume_dir(name).join("snapshots")
    }

    pub fn snapshot_path(&self, name: &VolumeName, token: &SnapshotToken) -> PathBuf {
        self.snapshots_dir(name).join(token.to_string())
    }

    pub fn meta_path(&self, name: &VolumeName, token: &SnapshotToken) -> PathBuf {
        self.snapshots_dir(name).join(format!("{}.meta", token))
    }

    pub fn staging_dir(&self, name: &VolumeName) -> PathBuf {
        self.volume_dir(name).join("staging")
    }

    /// Fresh path for a new writable subvolume
    pub fn new_subvol_path(&self, name: &VolumeName) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.volume_dir(name)
            .join(format!("{}{}", SUBVOL_PREFIX, &id[..12]))
    }

    /// Fresh staging area for one receive
    pub fn new_staging_path(&self, name: &VolumeName) -> PathBuf {
        self.staging_dir(name)
            .join(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Ensure the pool directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.volumes_dir())
    }

    /// Ensure a volume's directories exist
    pub fn ensure_volume_dirs(&self, name: &VolumeName) -> std::io::Result<()> {
        std::fs::create_dir_all(self.snapshots_dir(name))?;
        std::fs::create_dir_all(self.staging_dir(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_rooted_under_volume() {
        let layout = StorageLayout::new(PathBuf::from("/pool"));
        let name = VolumeName::new("user-7").unwrap();
        let token = SnapshotToken::next(3);

        assert_eq!(layout.volume_dir(&name), PathBuf::from("/pool/volumes/user-7"));
        assert_eq!(layout.mountpoint(&name), PathBuf::from("/pool/volumes/user-7/live"));
        assert!(layout.snapshot_path(&name, &token).starts_with(layout.snapshots_dir(&name)));
        assert!(layout.new_subvol_path(&name).starts_with(layout.volume_dir(&name)));
        assert_ne!(layout.new_subvol_path(&name), layout.new_subvol_path(&name));
    }
}
