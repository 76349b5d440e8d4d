//! Snapshot Manager Module
//!
//! Local volume storage: writable subvolumes, sealed read-only snapshots
//! and stream production. Filesystem work runs on blocking threads under
//! per-volume locks.

mod backend;
mod btrfs;
mod layout;
mod locks;
mod plain;
mod store;
pub mod tree;

pub use backend::{backend_for, SubvolumeBackend};
pub use btrfs::BtrfsBackend;
pub use layout::StorageLayout;
pub use locks::{VolumeLock, VolumeLocks};
pub use plain::PlainBackend;
pub use store::{SnapshotMeta, StagedSnapshot, VolumeStore};

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::transfer::TransferStream;
use crate::volume::{SnapshotRef, SnapshotToken, VolumeName};

/// Async front end for a [`VolumeStore`]
#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<VolumeStore>,
    locks: VolumeLocks,
}

impl SnapshotManager {
    pub fn new(layout: StorageLayout, backend: Arc<dyn SubvolumeBackend>, keep: usize) -> Self {
        Self {
            store: Arc::new(VolumeStore::new(layout, backend, keep)),
            locks: VolumeLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    pub fn locks(&self) -> &VolumeLocks {
        &self.locks
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.store.backend().kind()
    }

    /// Run blocking storage work off the async runtime
    pub(crate) async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&VolumeStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    pub fn exists(&self, name: &VolumeName) -> bool {
        self.store.exists(name)
    }

    /// Path containers mount for this volume
    pub fn mountpoint(&self, name: &VolumeName) -> PathBuf {
        self.store.layout().mountpoint(name)
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeName>> {
        self.run_blocking(|store| store.list_volumes()).await
    }

    /// Create a volume, empty or as a writable copy of `template`
    pub async fn create_volume(
        &self,
        name: &VolumeName,
        template: Option<&VolumeName>,
    ) -> Result<PathBuf> {
        let lock = self.locks.get(name);

        match template {
            None => {
                let _state = lock.state.write().await;
                let owned = name.clone();
                self.run_blocking(move |store| store.create_volume(&owned, None))
                    .await?;
            }
            Some(template) if template == name => {
                return Err(Error::Conflict(format!(
                    "volume {} cannot be its own template",
                    name
                )));
            }
            Some(template) => {
                // Two volumes: always lock in name order
                let template_lock = self.locks.get(template);
                let (first, second) = if name < template {
                    (&lock, &template_lock)
                } else {
                    (&template_lock, &lock)
                };
                let _first = first.state.write().await;
                let _second = second.state.write().await;

                let (owned, template) = (name.clone(), template.clone());
                self.run_blocking(move |store| store.create_volume(&owned, Some(&template)))
                    .await?;
            }
        }

        Ok(self.mountpoint(name))
    }

    /// Delete a volume and all of its snapshots
    pub async fn remove_volume(&self, name: &VolumeName) -> Result<()> {
        let lock = self.locks.get(name);
        {
            let _receive = lock.receive.lock().await;
            let _state = lock.state.write().await;
            let owned = name.clone();
            self.run_blocking(move |store| store.remove_volume(&owned))
                .await?;
        }
        drop(lock);
        self.locks.forget(name);
        Ok(())
    }

    /// Capture the current state as a read-only snapshot.
    ///
    /// Returns the latest snapshot unchanged when nothing was written since.
    /// That check runs under the shared lock; only taking a new snapshot
    /// excludes readers.
    pub async fn seal(&self, name: &VolumeName) -> Result<SnapshotRef> {
        let lock = self.locks.get(name);
        {
            let _state = lock.state.read().await;
            let owned = name.clone();
            if let Some(reused) = self.run_blocking(move |store| store.unchanged(&owned)).await? {
                return Ok(reused);
            }
        }

        let _state = lock.state.write().await;
        let owned = name.clone();
        self.run_blocking(move |store| store.seal(&owned)).await
    }

    /// Serialize snapshot `target`, incrementally against the newest of
    /// `known` that this node still holds
    pub async fn produce_stream(
        &self,
        name: &VolumeName,
        target: &SnapshotToken,
        known: &[SnapshotToken],
    ) -> Result<TransferStream> {
        let lock = self.locks.get(name);
        let _state = lock.state.read().await;
        let (owned, target, known) = (name.clone(), target.clone(), known.to_vec());
        self.run_blocking(move |store| store.produce(&owned, &target, &known))
            .await
    }

    /// Latest sealed snapshot, if any
    pub async fn current(&self, name: &VolumeName) -> Result<Option<SnapshotToken>> {
        Ok(self.history(name).await?.pop())
    }

    /// Sealed snapshots, oldest first
    pub async fn history(&self, name: &VolumeName) -> Result<Vec<SnapshotToken>> {
        let lock = self.locks.get(name);
        let _state = lock.state.read().await;
        let owned = name.clone();
        self.run_blocking(move |store| {
            if !store.exists(&owned) {
                return Err(Error::NotFound(format!("volume {}", owned)));
            }
            store.history(&owned)
        })
        .await
    }

    /// Apply the retention count now
    pub async fn prune(&self, name: &VolumeName) -> Result<Vec<SnapshotToken>> {
        let lock = self.locks.get(name);
        let _state = lock.state.write().await;
        let owned = name.clone();
        self.run_blocking(move |store| store.prune(&owned)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::StreamKind;
    use tempfile::{tempdir, TempDir};

    fn manager(keep: usize) -> (TempDir, SnapshotManager) {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        let manager = SnapshotManager::new(layout, Arc::new(PlainBackend::new()), keep);
        (dir, manager)
    }

    fn write(manager: &SnapshotManager, name: &VolumeName, file: &str, data: &str) {
        std::fs::write(manager.mountpoint(name).join(file), data).unwrap();
    }

    #[tokio::test]
    async fn test_seal_is_idempotent() {
        let (_dir, manager) = manager(4);
        let name = VolumeName::new("alice").unwrap();
        manager.create_volume(&name, None).await.unwrap();
        write(&manager, &name, "notes.txt", "v1");

        let first = manager.seal(&name).await.unwrap();
        let again = manager.seal(&name).await.unwrap();
        assert_eq!(first.token, again.token);
        assert_eq!(manager.history(&name).await.unwrap().len(), 1);

        write(&manager, &name, "notes.txt", "v2");
        let changed = manager.seal(&name).await.unwrap();
        assert!(changed.token > first.token);
        assert_eq!(changed.token.generation(), first.token.generation() + 1);
        assert_eq!(manager.current(&name).await.unwrap(), Some(changed.token));
    }

    /// Plain backend whose first snapshot is followed by a write to the source
    struct LateWriteBackend {
        inner: PlainBackend,
        fired: std::sync::atomic::AtomicBool,
    }

    impl SubvolumeBackend for LateWriteBackend {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }

        fn check_pool(&self, root: &std::path::Path) -> Result<()> {
            self.inner.check_pool(root)
        }

        fn create(&self, path: &std::path::Path) -> Result<()> {
            self.inner.create(path)
        }

        fn snapshot(&self, source: &std::path::Path, dest: &std::path::Path, readonly: bool) -> Result<()> {
            self.inner.snapshot(source, dest, readonly)?;
            if readonly && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                std::fs::write(source.join("late"), b"written during seal")?;
            }
            Ok(())
        }

        fn delete(&self, path: &std::path::Path) -> Result<()> {
            self.inner.delete(path)
        }

        fn fingerprint(&self, path: &std::path::Path) -> Result<String> {
            self.inner.fingerprint(path)
        }

        fn sealed_fingerprint(&self, snapshot: &std::path::Path) -> Result<String> {
            self.inner.sealed_fingerprint(snapshot)
        }

        fn send(&self, snapshot: &std::path::Path, parent: Option<&std::path::Path>) -> Result<Vec<u8>> {
            self.inner.send(snapshot, parent)
        }

        fn receive(
            &self,
            payload: &[u8],
            parent: Option<&std::path::Path>,
            staging: &std::path::Path,
            name: &str,
        ) -> Result<PathBuf> {
            self.inner.receive(payload, parent, staging, name)
        }
    }

    #[tokio::test]
    async fn test_write_during_seal_is_not_lost() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        let backend = Arc::new(LateWriteBackend {
            inner: PlainBackend::new(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let manager = SnapshotManager::new(layout, backend, 4);
        let name = VolumeName::new("alice").unwrap();
        manager.create_volume(&name, None).await.unwrap();
        write(&manager, &name, "notes.txt", "v1");

        let first = manager.seal(&name).await.unwrap();
        assert!(!first.path.join("late").exists());
        assert!(manager.mountpoint(&name).join("late").exists());

        let second = manager.seal(&name).await.unwrap();
        assert!(second.token > first.token);
        assert!(second.path.join("late").exists());

        let third = manager.seal(&name).await.unwrap();
        assert_eq!(third.token, second.token);
    }

    #[tokio::test]
    async fn test_unchanged_seal_runs_beside_readers() {
        let (_dir, manager) = manager(4);
        let name = VolumeName::new("alice").unwrap();
        manager.create_volume(&name, None).await.unwrap();
        write(&manager, &name, "notes.txt", "v1");
        let sealed = manager.seal(&name).await.unwrap();

        let lock = manager.locks().get(&name);
        let _reader = lock.state.read().await;
        let again = tokio::time::timeout(std::time::Duration::from_secs(5), manager.seal(&name))
            .await
            .expect("unchanged seal waited for the reader")
            .unwrap();
        assert_eq!(again.token, sealed.token);
    }

    #[tokio::test]
    async fn test_absent_volume_holds_no_lock() {
        let (_dir, manager) = manager(4);

        for i in 0..200 {
            let name = VolumeName::new(format!("ghost-{}", i)).unwrap();
            assert!(matches!(manager.seal(&name).await, Err(Error::NotFound(_))));
            assert!(matches!(manager.history(&name).await, Err(Error::NotFound(_))));
        }
        assert_eq!(manager.locks().len(), 0);
    }

    #[tokio::test]
    async fn test_produce_full_and_incremental() {
        let (_dir, manager) = manager(4);
        let name = VolumeName::new("alice").unwrap();
        manager.create_volume(&name, None).await.unwrap();

        write(&manager, &name, "a", "1");
        let t1 = manager.seal(&name).await.unwrap().token;
        write(&manager, &name, "b", "2");
        let t2 = manager.seal(&name).await.unwrap().token;

        let full = manager.produce_stream(&name, &t2, &[]).await.unwrap();
        assert_eq!(full.header.kind, StreamKind::Full);
        assert_eq!(full.token(), &t2);

        let incremental = manager
            .produce_stream(&name, &t2, &[t1.clone()])
            .await
            .unwrap();
        assert_eq!(incremental.parent(), Some(&t1));

        // Known tokens this node never had are ignored
        let stranger = SnapshotToken::next(1);
        let fallback = manager
            .produce_stream(&name, &t2, &[stranger])
            .await
            .unwrap();
        assert_eq!(fallback.header.kind, StreamKind::Full);
    }

    #[tokio::test]
    async fn test_pruned_snapshot_is_expired() {
        let (_dir, manager) = manager(2);
        let name = VolumeName::new("bob").unwrap();
        manager.create_volume(&name, None).await.unwrap();

        let mut tokens = Vec::new();
        for i in 0..3 {
            write(&manager, &name, "counter", &i.to_string());
            tokens.push(manager.seal(&name).await.unwrap().token);
        }
        assert_eq!(manager.history(&name).await.unwrap(), tokens[1..].to_vec());

        assert!(matches!(
            manager.produce_stream(&name, &tokens[0], &[]).await,
            Err(Error::Expired(_))
        ));
        assert!(matches!(
            manager.produce_stream(&name, &SnapshotToken::next(99), &[]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_volume() {
        let (_dir, manager) = manager(4);
        let name = VolumeName::new("nobody").unwrap();

        assert!(matches!(manager.seal(&name).await, Err(Error::NotFound(_))));
        assert!(matches!(manager.history(&name).await, Err(Error::NotFound(_))));
        assert!(matches!(
            manager.produce_stream(&name, &SnapshotToken::next(1), &[]).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(manager.remove_volume(&name).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_from_template_and_remove() {
        let (_dir, manager) = manager(4);
        let template = VolumeName::new("skeleton").unwrap();
        let name = VolumeName::new("carol").unwrap();

        manager.create_volume(&template, None).await.unwrap();
        write(&manager, &template, ".profile", "PATH=/bin");

        let mountpoint = manager.create_volume(&name, Some(&template)).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(mountpoint.join(".profile")).unwrap(),
            "PATH=/bin"
        );
        assert!(matches!(
            manager.create_volume(&name, None).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(manager.list_volumes().await.unwrap(), vec![name.clone(), template.clone()]);

        manager.seal(&name).await.unwrap();
        manager.remove_volume(&name).await.unwrap();
        assert!(!manager.exists(&name));
        assert!(!manager.store().layout().volume_dir(&name).exists());
        assert!(manager.exists(&template));
    }
}
