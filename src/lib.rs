//! WolfVol - Snapshot-based volume migration between storage nodes
//!
//! Keeps per-user volumes on copy-on-write storage and moves them between
//! hosts by streaming incremental snapshot diffs over HTTP.
//!
//! # Architecture
//!
//! Every node serves its volumes through the transfer API. A `GET` seals the
//! current state and returns it as a stream, incremental against any snapshot
//! the caller says it already holds. A `PUT` applies such a stream atomically
//! or rejects it without touching the volume. Ownership records in the
//! catalog say which host a volume is active on, and mounting a volume
//! elsewhere pulls it from that host first.
//!
//! # Features
//!
//! - btrfs subvolume backend with send/receive, and a plain directory backend
//! - Idempotent sealing and ETag-based conditional pulls
//! - Overlay volumes that borrow another volume's storage
//! - Retention of the newest snapshots per volume
//! - Single-process guard on the storage root

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod snapshot;
pub mod transfer;
pub mod volume;

pub use config::WolfVolConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{Catalog, OverlayRecord};
    pub use crate::config::WolfVolConfig;
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::VolumeLifecycle;
    pub use crate::snapshot::{SnapshotManager, StorageLayout, SubvolumeBackend};
    pub use crate::transfer::{Receiver, TransferClient, TransferStream};
    pub use crate::volume::{SnapshotRef, SnapshotToken, VolumeName};
}
