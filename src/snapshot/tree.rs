//! Directory tree scanning, digests and diffs
//!
//! Used by the plain backend, where snapshots are ordinary directories.
//! A [`TreeDiff`] is an ordered list of operations that turns the parent tree
//! into the target tree: removals first (deepest paths first), then creations
//! in path order so directories exist before their children.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File, Permissions};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Relative path inside a tree as raw bytes
pub type RelPath = Vec<u8>;

/// Scanned tree entry
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir { mode: u32 },
    File { mode: u32, digest: [u8; 32] },
    Symlink { target: Vec<u8> },
}

impl Node {
    fn same_kind(&self, other: &Node) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// One step of a tree diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeOp {
    /// Remove a path and everything below it
    Remove { path: RelPath },
    /// Create a directory (or update its mode)
    Dir { path: RelPath, mode: u32 },
    /// Create or replace a regular file
    File { path: RelPath, mode: u32, data: Vec<u8> },
    /// Create or replace a symlink
    Symlink { path: RelPath, target: Vec<u8> },
}

/// Ordered operations turning one tree into another
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeDiff {
    pub ops: Vec<TreeOp>,
}

impl TreeDiff {
    /// Compute the diff from `parent` (or an empty tree) to `target`
    pub fn between(parent: Option<&Path>, target: &Path) -> Result<Self> {
        let old = match parent {
            Some(parent) => scan(parent)?,
            None => BTreeMap::new(),
        };
        let new = scan(target)?;
        let mut ops = Vec::new();

        for (path, node) in old.iter().rev() {
            match new.get(path) {
                Some(current) if current.same_kind(node) => {}
                _ => ops.push(TreeOp::Remove { path: path.clone() }),
            }
        }

        for (path, node) in &new {
            if old.get(path) == Some(node) {
                continue;
            }
            ops.push(match node {
                Node::Dir { mode } => TreeOp::Dir {
                    path: path.clone(),
                    mode: *mode,
                },
                Node::File { mode, .. } => TreeOp::File {
                    path: path.clone(),
                    mode: *mode,
                    data: fs::read(target.join(OsStr::from_bytes(path)))?,
                },
                Node::Symlink { target: link } => TreeOp::Symlink {
                    path: path.clone(),
                    target: link.clone(),
                },
            });
        }

        Ok(Self { ops })
    }

    /// Apply the operations below `root`
    pub fn apply(&self, root: &Path) -> Result<()> {
        let mut dir_modes = Vec::new();

        for op in &self.ops {
            match op {
                TreeOp::Remove { path } => {
                    remove_path(&resolve(root, path)?)?;
                }
                TreeOp::Dir { path, mode } => {
                    let full = resolve(root, path)?;
                    if let Ok(meta) = fs::symlink_metadata(&full) {
                        if !meta.is_dir() {
                            remove_path(&full)?;
                        }
                    }
                    fs::create_dir_all(&full)?;
                    dir_modes.push((full, *mode));
                }
                TreeOp::File { path, mode, data } => {
                    let full = resolve(root, path)?;
                    remove_path(&full)?;
                    fs::write(&full, data)?;
                    fs::set_permissions(&full, Permissions::from_mode(*mode))?;
                }
                TreeOp::Symlink { path, target } => {
                    let full = resolve(root, path)?;
                    remove_path(&full)?;
                    symlink(OsStr::from_bytes(target), &full)?;
                }
            }
        }

        // Modes last, deepest first, so read-only directories can still be filled
        for (path, mode) in dir_modes.iter().rev() {
            fs::set_permissions(path, Permissions::from_mode(*mode))?;
        }
        Ok(())
    }

    /// Serialize and compress
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = bincode::serialize(self)?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Decompress and deserialize
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| Error::TransferCorrupt(format!("payload decompression failed: {}", e)))?;
        bincode::deserialize(&raw)
            .map_err(|e| Error::TransferCorrupt(format!("payload decoding failed: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Content digest of a whole tree (hex SHA-256)
pub fn digest(root: &Path) -> Result<String> {
    let nodes = scan(root)?;
    let mut hasher = Sha256::new();

    for (path, node) in &nodes {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path);
        match node {
            Node::Dir { mode } => {
                hasher.update([0u8]);
                hasher.update(mode.to_le_bytes());
            }
            Node::File { mode, digest } => {
                hasher.update([1u8]);
                hasher.update(mode.to_le_bytes());
                hasher.update(digest);
            }
            Node::Symlink { target } => {
                hasher.update([2u8]);
                hasher.update((target.len() as u64).to_le_bytes());
                hasher.update(target);
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copy `src` to the new directory `dst`
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;

    let mut dir_modes = vec![(dst.to_path_buf(), meta.permissions().mode() & 0o7777)];
    copy_dir_contents(src, dst, &mut dir_modes)?;

    for (path, mode) in dir_modes.iter().rev() {
        fs::set_permissions(path, Permissions::from_mode(*mode))?;
    }
    Ok(())
}

fn copy_dir_contents(src: &Path, dst: &Path, dir_modes: &mut Vec<(PathBuf, u32)>) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            fs::create_dir(&to)?;
            dir_modes.push((to.clone(), meta.permissions().mode() & 0o7777));
            copy_dir_contents(&from, &to, dir_modes)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn scan(root: &Path) -> Result<BTreeMap<RelPath, Node>> {
    let mut nodes = BTreeMap::new();
    scan_into(root, root, &mut nodes)?;
    Ok(nodes)
}

fn scan_into(root: &Path, dir: &Path, nodes: &mut BTreeMap<RelPath, Node>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        let rel = path
            .strip_prefix(root)
            .map_err(|_| Error::Internal(format!("{} escaped {}", path.display(), root.display())))?
            .as_os_str()
            .as_bytes()
            .to_vec();
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(&path)?;
            nodes.insert(rel, Node::Symlink {
                target: target.as_os_str().as_bytes().to_vec(),
            });
        } else if file_type.is_dir() {
            nodes.insert(rel, Node::Dir {
                mode: meta.permissions().mode() & 0o7777,
            });
            scan_into(root, &path, nodes)?;
        } else if file_type.is_file() {
            nodes.insert(rel, Node::File {
                mode: meta.permissions().mode() & 0o7777,
                digest: hash_file(&path)?,
            });
        }
        // Sockets, fifos and device nodes are not carried
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Join a relative stream path onto `root`, refusing anything that escapes it
fn resolve(root: &Path, rel: &[u8]) -> Result<PathBuf> {
    let rel = Path::new(OsStr::from_bytes(rel));
    let safe = !rel.as_os_str().is_empty()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(Error::TransferCorrupt(format!(
            "unsafe path in stream: {}",
            rel.display()
        )));
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("docs/notes")).unwrap();
        fs::write(root.join("docs/readme.txt"), b"hello").unwrap();
        fs::write(root.join("docs/notes/a.md"), b"# a").unwrap();
        fs::write(root.join(".bashrc"), b"export PS1='$ '").unwrap();
        symlink("docs/readme.txt", root.join("readme")).unwrap();
    }

    #[test]
    fn test_full_diff_reproduces_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        populate(&src);

        let diff = TreeDiff::between(None, &src).unwrap();
        let diff = TreeDiff::decode(&diff.encode().unwrap()).unwrap();
        diff.apply(&dst).unwrap();

        assert_eq!(digest(&src).unwrap(), digest(&dst).unwrap());
        assert_eq!(fs::read_link(dst.join("readme")).unwrap(), PathBuf::from("docs/readme.txt"));
    }

    #[test]
    fn test_incremental_diff() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let changed = dir.path().join("changed");
        let replica = dir.path().join("replica");
        fs::create_dir(&base).unwrap();
        populate(&base);
        copy_tree(&base, &changed).unwrap();
        copy_tree(&base, &replica).unwrap();

        // Modify, delete, add, and replace a file with a directory
        fs::write(changed.join("docs/readme.txt"), b"hello again").unwrap();
        fs::remove_dir_all(changed.join("docs/notes")).unwrap();
        fs::remove_file(changed.join(".bashrc")).unwrap();
        fs::create_dir(changed.join(".bashrc")).unwrap();
        fs::write(changed.join(".bashrc/env"), b"X=1").unwrap();
        fs::write(changed.join("new.bin"), [0u8, 1, 2, 3]).unwrap();

        let diff = TreeDiff::between(Some(&base), &changed).unwrap();
        assert!(!diff.ops.iter().any(|op| matches!(op, TreeOp::File { path, .. } if path == b"docs/notes/a.md")));
        diff.apply(&replica).unwrap();

        assert_eq!(digest(&changed).unwrap(), digest(&replica).unwrap());
    }

    #[test]
    fn test_unchanged_tree_has_empty_diff() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        populate(&a);
        copy_tree(&a, &b).unwrap();

        assert!(TreeDiff::between(Some(&a), &b).unwrap().is_empty());
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn test_digest_tracks_mode() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("run.sh"), b"#!/bin/sh").unwrap();
        let before = digest(dir.path()).unwrap();
        fs::set_permissions(dir.path().join("run.sh"), Permissions::from_mode(0o755)).unwrap();
        assert_ne!(before, digest(dir.path()).unwrap());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let diff = TreeDiff {
            ops: vec![TreeOp::File {
                path: b"../outside".to_vec(),
                mode: 0o644,
                data: vec![],
            }],
        };
        assert!(matches!(diff.apply(dir.path()), Err(Error::TransferCorrupt(_))));

        let absolute = TreeDiff {
            ops: vec![TreeOp::Remove { path: b"/etc".to_vec() }],
        };
        assert!(matches!(absolute.apply(dir.path()), Err(Error::TransferCorrupt(_))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(TreeDiff::decode(b"not a diff"), Err(Error::TransferCorrupt(_))));
    }
}
