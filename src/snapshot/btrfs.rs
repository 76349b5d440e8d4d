//! btrfs backend
//!
//! Drives the `btrfs` command line tool. Snapshots are read-only btrfs
//! snapshots and streams are `btrfs send` output, incremental when a parent
//! is given.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::debug;

use crate::config::BackendKind;
use crate::error::{Error, Result};

use super::backend::SubvolumeBackend;

/// Backend shelling out to `btrfs`
#[derive(Debug, Clone)]
pub struct BtrfsBackend {
    binary: PathBuf,
}

impl Default for BtrfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BtrfsBackend {
    /// Use `btrfs` from `PATH`
    pub fn new() -> Self {
        Self::with_binary("btrfs")
    }

    /// Use a specific `btrfs` executable
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Numeric field of `btrfs subvolume show`
    fn show_field(&self, path: &Path, field: &str) -> Result<u64> {
        let mut cmd = self.command();
        cmd.arg("subvolume").arg("show").arg(path);
        let output = self.run(cmd)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_field(&stdout, field).ok_or_else(|| {
            Error::Backend(format!(
                "no {} in subvolume show for {}",
                field.trim_end_matches(':'),
                path.display()
            ))
        })
    }

    fn run(&self, mut command: Command) -> Result<Output> {
        debug!("Running {:?}", command);
        let output = command.output().map_err(|e| {
            Error::Backend(format!("failed to run {}: {}", self.binary.display(), e))
        })?;

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "{:?} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl SubvolumeBackend for BtrfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Btrfs
    }

    fn check_pool(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root).map_err(|e| {
            Error::StorageUnavailable(format!("cannot create {}: {}", root.display(), e))
        })?;

        let mut cmd = self.command();
        cmd.arg("filesystem").arg("df").arg(root);
        self.run(cmd).map_err(|e| {
            Error::StorageUnavailable(format!("{} is not a usable btrfs pool: {}", root.display(), e))
        })?;
        Ok(())
    }

    fn create(&self, path: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("subvolume").arg("create").arg(path);
        self.run(cmd)?;
        Ok(())
    }

    fn snapshot(&self, source: &Path, dest: &Path, readonly: bool) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("subvolume").arg("snapshot");
        if readonly {
            cmd.arg("-r");
        }
        cmd.arg(source).arg(dest);
        self.run(cmd)?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(());
        }
        let mut cmd = self.command();
        cmd.arg("subvolume").arg("delete").arg(path);
        self.run(cmd)?;
        Ok(())
    }

    /// The subvolume's transaction generation, which advances on every write
    fn fingerprint(&self, path: &Path) -> Result<String> {
        let generation = self.show_field(path, "Generation:")?;
        Ok(format!("gen:{}", generation))
    }

    /// Taking a snapshot rewrites the source's root in the snapshot's own
    /// transaction, so an untouched source stays at the snapshot's creation
    /// generation.
    fn sealed_fingerprint(&self, snapshot: &Path) -> Result<String> {
        let generation = self.show_field(snapshot, "Gen at creation:")?;
        Ok(format!("gen:{}", generation))
    }

    fn send(&self, snapshot: &Path, parent: Option<&Path>) -> Result<Vec<u8>> {
        let mut cmd = self.command();
        cmd.arg("send").arg("-q");
        if let Some(parent) = parent {
            cmd.arg("-p").arg(parent);
        }
        cmd.arg(snapshot);
        Ok(self.run(cmd)?.stdout)
    }

    /// `btrfs receive` locates the parent itself by received UUID, so
    /// `parent` is not passed on.
    fn receive(
        &self,
        payload: &[u8],
        _parent: Option<&Path>,
        staging: &Path,
        name: &str,
    ) -> Result<PathBuf> {
        let stream_file = staging.join(".stream");
        fs::write(&stream_file, payload)?;

        let mut cmd = self.command();
        cmd.arg("receive").arg("-f").arg(&stream_file).arg(staging);
        let result = self.run(cmd);
        let _ = fs::remove_file(&stream_file);

        result.map_err(|e| match e {
            Error::Backend(msg) => Error::TransferCorrupt(format!("btrfs receive rejected stream: {}", msg)),
            other => other,
        })?;

        let received = staging.join(name);
        if !received.is_dir() {
            return Err(Error::TransferCorrupt(format!(
                "stream did not contain snapshot {}",
                name
            )));
        }
        Ok(received)
    }
}

/// Extract a numeric field such as `Generation:` from `btrfs subvolume show` output
fn parse_field(output: &str, field: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(field))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SHOW_OUTPUT: &str = "volumes/alice/subvol-1a2b3c4d5e6f
\tName: \t\t\tsubvol-1a2b3c4d5e6f
\tUUID: \t\t\t5b1f0b7e-0c0c-4a4e-9d1c-2f9a7f3c1e11
\tParent UUID: \t\t-
\tReceived UUID: \t\t-
\tCreation time: \t\t2024-03-02 10:11:12 +0000
\tSubvolume ID: \t\t261
\tGeneration: \t\t4821
\tGen at creation: \t4790
\tParent ID: \t\t5
\tTop level ID: \t\t5
\tFlags: \t\t\t-
";

    #[test]
    fn test_parse_generation() {
        assert_eq!(parse_field(SHOW_OUTPUT, "Generation:"), Some(4821));
        assert_eq!(parse_field(SHOW_OUTPUT, "Gen at creation:"), Some(4790));
        assert_eq!(parse_field("Name: x\n", "Generation:"), None);
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempdir().unwrap();
        let backend = BtrfsBackend::with_binary("/nonexistent/btrfs");

        assert!(matches!(
            backend.check_pool(dir.path()),
            Err(Error::StorageUnavailable(_))
        ));
        assert!(matches!(
            backend.create(&dir.path().join("sub")),
            Err(Error::Backend(_))
        ));
        // Deleting something that is not there never reaches the binary
        backend.delete(&dir.path().join("missing")).unwrap();
    }

    /// Needs root and a btrfs mount at `WOLFVOL_BTRFS_ROOT`
    #[cfg(feature = "integration")]
    #[test]
    fn test_btrfs_roundtrip() {
        let root = PathBuf::from(
            std::env::var("WOLFVOL_BTRFS_ROOT").expect("WOLFVOL_BTRFS_ROOT not set"),
        );
        let base = root.join(format!("it-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(base.join("staging")).unwrap();
        let backend = BtrfsBackend::new();
        backend.check_pool(&root).unwrap();

        let live = base.join("live");
        backend.create(&live).unwrap();
        fs::write(live.join("a"), b"a").unwrap();
        backend.snapshot(&live, &base.join("s1"), true).unwrap();
        let sealed = backend.sealed_fingerprint(&base.join("s1")).unwrap();
        assert_eq!(backend.fingerprint(&live).unwrap(), sealed);
        fs::write(live.join("b"), b"b").unwrap();
        Command::new("sync").status().unwrap();
        assert_ne!(backend.fingerprint(&live).unwrap(), sealed);

        let payload = backend.send(&base.join("s1"), None).unwrap();
        let received = backend
            .receive(&payload, None, &base.join("staging"), "s1")
            .unwrap();
        assert_eq!(fs::read(received.join("a")).unwrap(), b"a");

        for path in [&received, &base.join("s1"), &live] {
            backend.delete(path).unwrap();
        }
        fs::remove_dir_all(&base).unwrap();
    }
}
