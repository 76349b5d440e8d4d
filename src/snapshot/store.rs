//! Blocking volume storage operations
//!
//! Callers hold the appropriate [`VolumeLock`](super::locks::VolumeLock)
//! before calling anything here.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transfer::{StreamKind, TransferStream};
use crate::volume::{SnapshotRef, SnapshotToken, VolumeName};

use super::backend::SubvolumeBackend;
use super::layout::{StorageLayout, SUBVOL_PREFIX};

/// Sidecar metadata written next to every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub token: SnapshotToken,
    /// Backend fingerprint of the writable state this snapshot was taken from
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// A received snapshot waiting in staging
#[derive(Debug)]
pub struct StagedSnapshot {
    /// Staging area owned by this receive
    pub dir: PathBuf,
    /// The received read-only snapshot inside `dir`
    pub path: PathBuf,
}

/// Volume storage on one pool
pub struct VolumeStore {
    layout: StorageLayout,
    backend: Arc<dyn SubvolumeBackend>,
    keep: usize,
}

impl VolumeStore {
    pub fn new(layout: StorageLayout, backend: Arc<dyn SubvolumeBackend>, keep: usize) -> Self {
        Self {
            layout,
            backend,
            keep,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn backend(&self) -> &dyn SubvolumeBackend {
        self.backend.as_ref()
    }

    /// Whether the volume has a live subvolume
    pub fn exists(&self, name: &VolumeName) -> bool {
        fs::symlink_metadata(self.layout.mountpoint(name)).is_ok()
    }

    fn require(&self, name: &VolumeName) -> Result<()> {
        if self.exists(name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("volume {}", name)))
        }
    }

    /// Resolve the live link to the current writable subvolume
    pub fn live_path(&self, name: &VolumeName) -> Result<PathBuf> {
        let target = fs::read_link(self.layout.mountpoint(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("volume {}", name))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(self.layout.volume_dir(name).join(target))
    }

    /// All volumes on the pool, sorted by name
    pub fn list_volumes(&self) -> Result<Vec<VolumeName>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(self.layout.volumes_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().and_then(|s| VolumeName::new(s).ok()) else {
                continue;
            };
            if self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create a volume, empty or as a writable copy of `template`
    pub fn create_volume(&self, name: &VolumeName, template: Option<&VolumeName>) -> Result<()> {
        if self.exists(name) {
            return Err(Error::Conflict(format!("volume {} already exists", name)));
        }
        let source = template.map(|t| self.live_path(t)).transpose()?;

        self.layout.ensure_volume_dirs(name)?;
        let subvol = self.layout.new_subvol_path(name);
        match &source {
            Some(source) => self.backend.snapshot(source, &subvol, false)?,
            None => self.backend.create(&subvol)?,
        }

        if let Err(e) = self.swap_live(name, &subvol) {
            let _ = self.backend.delete(&subvol);
            return Err(e);
        }

        match template {
            Some(t) => info!("Created volume {} from template {}", name, t),
            None => info!("Created volume {}", name),
        }
        Ok(())
    }

    /// Atomically point the live link at `subvol`, returning the previous target
    fn swap_live(&self, name: &VolumeName, subvol: &Path) -> Result<Option<PathBuf>> {
        let previous = self.live_path(name).ok();
        let file_name = subvol
            .file_name()
            .ok_or_else(|| Error::Internal(format!("bad subvolume path {}", subvol.display())))?;

        let tmp = self
            .layout
            .volume_dir(name)
            .join(format!(".live-{}", uuid::Uuid::new_v4().simple()));
        symlink(file_name, &tmp)?;
        if let Err(e) = fs::rename(&tmp, self.layout.mountpoint(name)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(previous)
    }

    /// Delete a volume with all its snapshots
    pub fn remove_volume(&self, name: &VolumeName) -> Result<()> {
        self.require(name)?;
        let volume_dir = self.layout.volume_dir(name);

        for token in self.history(name)? {
            self.delete_snapshot(name, &token)?;
        }
        if let Ok(entries) = fs::read_dir(self.layout.staging_dir(name)) {
            for entry in entries {
                let dir = entry?.path();
                for inner in fs::read_dir(&dir)? {
                    let path = inner?.path();
                    if path.is_dir() {
                        self.backend.delete(&path)?;
                    }
                }
                fs::remove_dir_all(&dir)?;
            }
        }

        for entry in fs::read_dir(&volume_dir)? {
            let path = entry?.path();
            let is_subvol = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SUBVOL_PREFIX));
            if is_subvol {
                self.backend.delete(&path)?;
            }
        }

        fs::remove_dir_all(&volume_dir)?;
        info!("Removed volume {}", name);
        Ok(())
    }

    /// Sealed snapshots, oldest first. Empty when the volume has none.
    pub fn history(&self, name: &VolumeName) -> Result<Vec<SnapshotToken>> {
        let mut tokens = Vec::new();
        let entries = match fs::read_dir(self.layout.snapshots_dir(name)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tokens),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let Some(token) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<SnapshotToken>().ok())
            else {
                continue;
            };
            // Snapshots without metadata were never completed
            if self.layout.meta_path(name, &token).exists() {
                tokens.push(token);
            }
        }
        tokens.sort();
        Ok(tokens)
    }

    pub fn latest(&self, name: &VolumeName) -> Result<Option<SnapshotToken>> {
        Ok(self.history(name)?.pop())
    }

    pub fn read_meta(&self, name: &VolumeName, token: &SnapshotToken) -> Result<SnapshotMeta> {
        let raw = fs::read(self.layout.meta_path(name, token))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Internal(format!("bad metadata for {}/{}: {}", name, token, e)))
    }

    fn write_meta(&self, name: &VolumeName, meta: &SnapshotMeta) -> Result<()> {
        let path = self.layout.meta_path(name, &meta.token);
        let tmp = path.with_extension("meta.tmp");
        let raw = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::Internal(format!("cannot encode metadata: {}", e)))?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete_snapshot(&self, name: &VolumeName, token: &SnapshotToken) -> Result<()> {
        // Metadata goes first so a half-deleted snapshot drops out of the history
        match fs::remove_file(self.layout.meta_path(name, token)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.backend.delete(&self.layout.snapshot_path(name, token))
    }

    pub fn snapshot_ref(&self, name: &VolumeName, token: SnapshotToken) -> SnapshotRef {
        SnapshotRef {
            volume: name.clone(),
            path: self.layout.snapshot_path(name, &token),
            token,
        }
    }

    /// The latest snapshot, if the live state has not changed since it
    pub fn unchanged(&self, name: &VolumeName) -> Result<Option<SnapshotRef>> {
        let live = self.live_path(name)?;
        let latest = match self.latest(name)? {
            Some(latest) => latest,
            None => return Ok(None),
        };

        let meta = self.read_meta(name, &latest)?;
        if self.backend.fingerprint(&live)? == meta.fingerprint {
            debug!("Volume {} unchanged since {}", name, latest);
            return Ok(Some(self.snapshot_ref(name, latest)));
        }
        Ok(None)
    }

    /// Snapshot the live state, reusing the latest snapshot when nothing changed.
    ///
    /// The recorded fingerprint comes from the new snapshot, so a write that
    /// races the snapshot makes the next seal take a fresh one.
    pub fn seal(&self, name: &VolumeName) -> Result<SnapshotRef> {
        if let Some(reused) = self.unchanged(name)? {
            return Ok(reused);
        }

        let live = self.live_path(name)?;
        let generation = self.latest(name)?.map(|t| t.generation() + 1).unwrap_or(1);
        let token = SnapshotToken::next(generation);
        let path = self.layout.snapshot_path(name, &token);
        self.backend.snapshot(&live, &path, true)?;

        let recorded = self.backend.sealed_fingerprint(&path).and_then(|fingerprint| {
            self.write_meta(
                name,
                &SnapshotMeta {
                    token: token.clone(),
                    fingerprint,
                    created_at: Utc::now(),
                },
            )
        });
        if let Err(e) = recorded {
            let _ = self.backend.delete(&path);
            return Err(e);
        }

        info!("Sealed volume {} as {}", name, token);
        self.prune(name)?;
        Ok(self.snapshot_ref(name, token))
    }

    /// Serialize `target`, as a diff against the newest of `known` that is
    /// older than `target` and still held locally
    pub fn produce(
        &self,
        name: &VolumeName,
        target: &SnapshotToken,
        known: &[SnapshotToken],
    ) -> Result<TransferStream> {
        self.require(name)?;
        let history = self.history(name)?;

        if !history.contains(target) {
            let newest = history.last().map(|t| t.generation()).unwrap_or(0);
            return Err(if target.generation() > newest {
                Error::NotFound(format!("snapshot {} of {}", target, name))
            } else {
                Error::Expired(format!("snapshot {} of {} was pruned", target, name))
            });
        }

        let parent = known
            .iter()
            .filter(|k| *k < target && history.contains(k))
            .max();

        let parent_path = parent.map(|p| self.layout.snapshot_path(name, p));
        let payload = self
            .backend
            .send(&self.layout.snapshot_path(name, target), parent_path.as_deref())?;

        let kind = match parent {
            Some(parent) => StreamKind::Incremental {
                parent: parent.clone(),
            },
            None => StreamKind::Full,
        };
        debug!(
            "Produced {:?} stream of {} at {} ({} bytes)",
            kind,
            name,
            target,
            payload.len()
        );
        Ok(TransferStream::new(self.backend.kind(), kind, target.clone(), payload))
    }

    /// Delete the oldest snapshots beyond the retention count
    pub fn prune(&self, name: &VolumeName) -> Result<Vec<SnapshotToken>> {
        let history = self.history(name)?;
        if history.len() <= self.keep {
            return Ok(Vec::new());
        }

        let excess = history.len() - self.keep;
        let pruned: Vec<SnapshotToken> = history.into_iter().take(excess).collect();
        for token in &pruned {
            self.delete_snapshot(name, token)?;
            debug!("Pruned snapshot {} of {}", token, name);
        }
        Ok(pruned)
    }

    /// Materialize a stream in a fresh staging area
    pub fn stage(&self, name: &VolumeName, stream: &TransferStream) -> Result<StagedSnapshot> {
        let parent = match stream.parent() {
            Some(parent) => {
                let path = self.layout.snapshot_path(name, parent);
                if !self.layout.meta_path(name, parent).exists() {
                    return Err(Error::Conflict(format!(
                        "parent snapshot {} of {} is not present",
                        parent, name
                    )));
                }
                Some(path)
            }
            None => None,
        };

        self.layout.ensure_volume_dirs(name)?;
        let dir = self.layout.new_staging_path(name);
        fs::create_dir_all(&dir)?;

        match self.backend.receive(
            &stream.payload,
            parent.as_deref(),
            &dir,
            &stream.token().to_string(),
        ) {
            Ok(path) => Ok(StagedSnapshot { dir, path }),
            Err(e) => {
                self.discard(&StagedSnapshot {
                    path: dir.join(stream.token().to_string()),
                    dir,
                });
                Err(e)
            }
        }
    }

    /// Check a staged stream against the current history
    pub fn validate(&self, name: &VolumeName, stream: &TransferStream) -> Result<()> {
        let token = stream.token();
        let history = self.history(name)?;

        if let Some(parent) = stream.parent() {
            if parent.generation() >= token.generation() {
                return Err(Error::TransferCorrupt(format!(
                    "parent {} is not older than {}",
                    parent, token
                )));
            }
            if !history.contains(parent) {
                return Err(Error::Conflict(format!(
                    "parent snapshot {} of {} is no longer present",
                    parent, name
                )));
            }
        }

        if history.contains(token) {
            return Err(Error::Conflict(format!(
                "snapshot {} of {} already exists",
                token, name
            )));
        }
        Ok(())
    }

    /// Promote a staged snapshot to the volume's current state.
    ///
    /// Either completes or leaves the previous live state in place.
    pub fn commit(
        &self,
        name: &VolumeName,
        staged: StagedSnapshot,
        stream: &TransferStream,
    ) -> Result<SnapshotRef> {
        let token = stream.token().clone();
        let dest = self.layout.snapshot_path(name, &token);

        if let Err(e) = fs::rename(&staged.path, &dest) {
            self.discard(&staged);
            return Err(e.into());
        }
        let _ = fs::remove_dir_all(&staged.dir);

        let subvol = self.layout.new_subvol_path(name);
        let promoted = self
            .backend
            .snapshot(&dest, &subvol, false)
            .and_then(|_| self.backend.fingerprint(&subvol))
            .and_then(|fingerprint| {
                self.write_meta(
                    name,
                    &SnapshotMeta {
                        token: token.clone(),
                        fingerprint,
                        created_at: Utc::now(),
                    },
                )
            })
            .and_then(|_| self.swap_live(name, &subvol));

        let previous = match promoted {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Commit of {} at {} failed, rolling back: {}", name, token, e);
                let _ = self.backend.delete(&subvol);
                let _ = self.delete_snapshot(name, &token);
                return Err(e);
            }
        };

        if let Some(old) = previous {
            if let Err(e) = self.backend.delete(&old) {
                warn!("Failed to delete old subvolume {}: {}", old.display(), e);
            }
        }

        if let Err(e) = self.discard_divergent(name, stream) {
            warn!("Failed to discard divergent snapshots of {}: {}", name, e);
        }

        info!("Committed {} at {}", name, token);
        Ok(self.snapshot_ref(name, token))
    }

    /// Drop local snapshots that are not ancestors of the committed one
    fn discard_divergent(&self, name: &VolumeName, stream: &TransferStream) -> Result<()> {
        let token = stream.token();
        for local in self.history(name)? {
            if &local == token {
                continue;
            }
            let divergent = match &stream.header.kind {
                StreamKind::Incremental { parent } => local.generation() > parent.generation(),
                StreamKind::Full => local.generation() >= token.generation(),
            };
            if divergent {
                debug!("Discarding divergent snapshot {} of {}", local, name);
                self.delete_snapshot(name, &local)?;
            }
        }
        Ok(())
    }

    /// Remove a staging area and anything received into it
    pub fn discard(&self, staged: &StagedSnapshot) {
        if fs::symlink_metadata(&staged.path).is_ok() {
            if let Err(e) = self.backend.delete(&staged.path) {
                warn!("Failed to delete staged snapshot {}: {}", staged.path.display(), e);
            }
        }
        if let Err(e) = fs::remove_dir_all(&staged.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging area {}: {}", staged.dir.display(), e);
            }
        }
    }
}
