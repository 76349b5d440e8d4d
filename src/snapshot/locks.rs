//! Per-volume locks
//!
//! Every volume gets two async locks:
//! - `receive` serializes inbound transfers so at most one is in flight.
//! - `state` guards the snapshot history and the live link. Stream
//!   production takes it shared; seal, commit, prune and removal take it
//!   exclusively, so a reader never observes a half-promoted volume.
//!
//! The registry only keeps weak references. An entry lives while some
//! operation holds it, so polling names that never become volumes does not
//! grow the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::volume::VolumeName;

/// Locks for a single volume
#[derive(Default)]
pub struct VolumeLock {
    pub receive: AsyncMutex<()>,
    pub state: RwLock<()>,
}

/// Dead entries are swept once the map reaches this many slots
const MIN_SWEEP_AT: usize = 64;

struct Registry {
    entries: HashMap<VolumeName, Weak<VolumeLock>>,
    sweep_at: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            sweep_at: MIN_SWEEP_AT,
        }
    }
}

impl Registry {
    fn sweep(&mut self) {
        self.entries.retain(|_, lock| lock.strong_count() > 0);
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_AT);
    }
}

/// Registry of per-volume locks
#[derive(Clone, Default)]
pub struct VolumeLocks {
    inner: Arc<Mutex<Registry>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the locks for a volume, creating them if nobody holds them
    pub fn get(&self, name: &VolumeName) -> Arc<VolumeLock> {
        let mut registry = self.registry();
        if let Some(lock) = registry.entries.get(name).and_then(Weak::upgrade) {
            return lock;
        }

        if registry.entries.len() >= registry.sweep_at {
            registry.sweep();
        }
        let lock = Arc::new(VolumeLock::default());
        registry.entries.insert(name.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Drop the entry for a removed volume if nobody holds it
    pub fn forget(&self, name: &VolumeName) {
        let mut registry = self.registry();
        if let Some(lock) = registry.entries.get(name) {
            if lock.strong_count() == 0 {
                registry.entries.remove(name);
            }
        }
    }

    /// Number of volumes whose locks are currently held
    pub fn len(&self) -> usize {
        let mut registry = self.registry();
        registry.sweep();
        registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
