//! Volume Lifecycle
//!
//! The create/mount/unmount/remove primitives a container volume plugin
//! drives, composed from the catalog, the snapshot manager and the
//! transfer client.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{Catalog, OverlayRecord};
use crate::error::{Error, Result};
use crate::snapshot::SnapshotManager;
use crate::transfer::{PullOutcome, Receiver, TransferClient};
use crate::volume::{SnapshotRef, VolumeName};

/// Lifecycle operations for this node
#[derive(Clone)]
pub struct VolumeLifecycle {
    manager: SnapshotManager,
    catalog: Arc<Catalog>,
    receiver: Receiver,
    client: TransferClient,
    host: String,
}

impl VolumeLifecycle {
    pub fn new(
        manager: SnapshotManager,
        catalog: Arc<Catalog>,
        receiver: Receiver,
        client: TransferClient,
        host: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            catalog,
            receiver,
            client,
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Create a volume entry.
    ///
    /// With `overlay_target` the entry borrows the target's storage and
    /// nothing is created on disk. Otherwise a volume is created, empty or
    /// as a copy of `template`, and this host becomes its owner.
    pub async fn create(
        &self,
        name: &VolumeName,
        overlay_target: Option<&VolumeName>,
        template: Option<&VolumeName>,
    ) -> Result<OverlayRecord> {
        if let Some(target) = overlay_target {
            if template.is_some() {
                return Err(Error::Conflict(format!(
                    "overlay {} of {} cannot also use a template",
                    name, target
                )));
            }
            let record = self.catalog.register_volume(name, Some(target)).await?;
            info!("Created overlay {} of {}", name, target);
            return Ok(record);
        }

        if self.catalog.get_volume(name).await?.is_some() {
            return Err(Error::Conflict(format!("volume {} is already registered", name)));
        }

        self.manager.create_volume(name, template).await?;
        let record = match self.catalog.register_volume(name, None).await {
            Ok(record) => record,
            Err(e) => {
                // Keep storage and catalog in step
                let _ = self.manager.remove_volume(name).await;
                return Err(e);
            }
        };
        self.catalog.register_active(name, &self.host).await?;
        Ok(record)
    }

    /// Make a volume available on this host and return the path to mount.
    ///
    /// When another host owns the backing volume (or `source` names one), its
    /// latest state is pulled incrementally first. A volume that exists
    /// nowhere is created empty.
    pub async fn mount(&self, name: &VolumeName, source: Option<&str>) -> Result<PathBuf> {
        let backing = match self.catalog.get_volume(name).await? {
            Some(record) => record.backing_volume().clone(),
            None => name.clone(),
        };

        let owner = match source {
            Some(peer) => Some(peer.to_string()),
            None => self.catalog.active_owner(&backing).await?,
        };

        match owner {
            Some(owner) if owner != self.host => self.pull(&owner, &backing).await?,
            _ if !self.manager.exists(&backing) => {
                self.manager.create_volume(&backing, None).await?;
            }
            _ => debug!("Volume {} already local", backing),
        }

        self.catalog.ensure_volume(name).await?;
        self.catalog.register_active(&backing, &self.host).await?;
        let mountpoint = self.catalog.resolve_mountpoint(name).await?;
        info!("Mounted {} at {}", name, mountpoint.display());
        Ok(mountpoint)
    }

    /// Seal the volume so its latest state can be pulled elsewhere.
    /// Ownership stays with this host until another one takes over.
    pub async fn unmount(&self, name: &VolumeName) -> Result<SnapshotRef> {
        let backing = match self.catalog.get_volume(name).await? {
            Some(record) => record.backing_volume().clone(),
            None => name.clone(),
        };
        let sealed = self.manager.seal(&backing).await?;
        info!("Unmounted {} at {}", name, sealed.token);
        Ok(sealed)
    }

    /// Delete a volume entry, and its storage unless it is an overlay
    pub async fn remove(&self, name: &VolumeName) -> Result<()> {
        let record = self.catalog.get_volume(name).await?;
        let has_storage = self.manager.exists(name);

        match &record {
            Some(_) => self.catalog.remove_volume(name).await?,
            None if has_storage => {}
            None => return Err(Error::NotFound(format!("volume {}", name))),
        }

        let is_overlay = record.as_ref().is_some_and(|r| r.is_overlay());
        if !is_overlay && has_storage {
            self.manager.remove_volume(name).await?;
        }
        info!("Removed {}", name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<OverlayRecord>> {
        self.catalog.list_volumes().await
    }

    async fn pull(&self, peer: &str, name: &VolumeName) -> Result<()> {
        let known = if self.manager.exists(name) {
            self.manager.history(name).await?
        } else {
            Vec::new()
        };
        let current = known.last().cloned();

        match self.client.pull(peer, name, &known, current.as_ref()).await? {
            PullOutcome::NotModified => {
                debug!("Volume {} on {} matches local copy", name, peer);
                Ok(())
            }
            PullOutcome::Stream(stream) => {
                let outcome = self.receiver.receive_stream(name, stream).await?;
                info!("Pulled {} from {} at {}", name, peer, outcome.token());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{PlainBackend, StorageLayout};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn lifecycle(host: &str) -> (TempDir, VolumeLifecycle) {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        let catalog = Arc::new(Catalog::open(&dir.path().join("catalog.db"), layout.clone()).unwrap());
        let manager = SnapshotManager::new(layout, Arc::new(PlainBackend::new()), 4);
        let receiver = Receiver::new(manager.clone(), Arc::clone(&catalog), host);
        let client = TransferClient::new(Duration::from_secs(1), Duration::from_secs(5)).unwrap();
        let lifecycle = VolumeLifecycle::new(manager, catalog, receiver, client, host);
        (dir, lifecycle)
    }

    fn name(s: &str) -> VolumeName {
        VolumeName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_mount_unmount_remove() {
        let (_dir, lifecycle) = lifecycle("10.0.0.1:4000");
        let vol = name("alice");

        lifecycle.create(&vol, None, None).await.unwrap();
        assert!(matches!(
            lifecycle.create(&vol, None, None).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(
            lifecycle.catalog.active_owner(&vol).await.unwrap().as_deref(),
            Some("10.0.0.1:4000")
        );

        let path = lifecycle.mount(&vol, None).await.unwrap();
        std::fs::write(path.join("hello"), b"world").unwrap();

        let first = lifecycle.unmount(&vol).await.unwrap();
        let second = lifecycle.unmount(&vol).await.unwrap();
        assert_eq!(first.token, second.token);

        lifecycle.remove(&vol).await.unwrap();
        assert!(!lifecycle.manager.exists(&vol));
        assert!(matches!(lifecycle.remove(&vol).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_overlay_mounts_target_storage() {
        let (_dir, lifecycle) = lifecycle("node-a");
        let base = name("shared-home");
        let user = name("user-7");

        lifecycle.create(&base, None, None).await.unwrap();
        lifecycle.create(&user, Some(&base), None).await.unwrap();

        let user_path = lifecycle.mount(&user, None).await.unwrap();
        assert_eq!(user_path, lifecycle.manager.mountpoint(&base));
        assert!(!lifecycle.manager.exists(&user));

        // The target cannot go while the overlay exists
        assert!(matches!(lifecycle.remove(&base).await, Err(Error::Conflict(_))));
        lifecycle.remove(&user).await.unwrap();
        assert!(lifecycle.manager.exists(&base));
        lifecycle.remove(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_mount_unknown_volume_creates_it() {
        let (_dir, lifecycle) = lifecycle("node-a");
        let vol = name("fresh");

        let path = lifecycle.mount(&vol, None).await.unwrap();
        assert!(path.is_dir());
        assert!(lifecycle.catalog.get_volume(&vol).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_from_template() {
        let (_dir, lifecycle) = lifecycle("node-a");
        let template = name("skel");
        lifecycle.create(&template, None, None).await.unwrap();
        std::fs::write(lifecycle.manager.mountpoint(&template).join(".bashrc"), b"alias ll='ls -l'").unwrap();

        let vol = name("bob");
        lifecycle.create(&vol, None, Some(&template)).await.unwrap();
        let path = lifecycle.mount(&vol, None).await.unwrap();
        assert_eq!(std::fs::read(path.join(".bashrc")).unwrap(), b"alias ll='ls -l'");

        assert!(matches!(
            lifecycle.create(&name("x"), Some(&template), Some(&template)).await,
            Err(Error::Conflict(_))
        ));
    }
}
