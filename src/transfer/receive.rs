//! Inbound stream receiver
//!
//! A receive runs Idle -> Staging -> Validating -> Committing -> Idle. Staging
//! happens beside the live state without blocking readers; validation and
//! commit run under the volume's exclusive state lock so no reader sees a
//! half-applied stream. At most one receive per volume is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotManager;
use crate::volume::{SnapshotRef, SnapshotToken, VolumeName};

use super::stream::TransferStream;

/// Where a volume's receive currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveState {
    Idle,
    Staging,
    Validating,
    Committing,
}

/// Result of a successful receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The stream was applied and is now the volume's current state
    Committed(SnapshotRef),
    /// The volume already was at the stream's snapshot; nothing changed
    AlreadyCurrent(SnapshotToken),
}

impl ReceiveOutcome {
    pub fn token(&self) -> &SnapshotToken {
        match self {
            ReceiveOutcome::Committed(snapshot) => &snapshot.token,
            ReceiveOutcome::AlreadyCurrent(token) => token,
        }
    }
}

type StateMap = Arc<Mutex<HashMap<VolumeName, ReceiveState>>>;

/// Tracks one receive's state; resets to idle when dropped
struct StateGuard {
    states: StateMap,
    name: VolumeName,
}

impl StateGuard {
    fn new(states: &StateMap, name: &VolumeName) -> Self {
        let guard = Self {
            states: Arc::clone(states),
            name: name.clone(),
        };
        guard.set(ReceiveState::Staging);
        guard
    }

    fn set(&self, state: ReceiveState) {
        debug!("Receive of {} is {:?}", self.name, state);
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.name.clone(), state);
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// Applies transfer streams to local volumes
#[derive(Clone)]
pub struct Receiver {
    manager: SnapshotManager,
    catalog: Arc<Catalog>,
    host: String,
    states: StateMap,
}

impl Receiver {
    /// `host` is recorded as the active owner of every volume received here
    pub fn new(manager: SnapshotManager, catalog: Arc<Catalog>, host: impl Into<String>) -> Self {
        Self {
            manager,
            catalog,
            host: host.into(),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current receive state of a volume
    pub fn state(&self, name: &VolumeName) -> ReceiveState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(ReceiveState::Idle)
    }

    /// Volumes with a receive in flight
    pub fn in_flight(&self) -> Vec<(VolumeName, ReceiveState)> {
        let mut active: Vec<_> = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, state)| (name.clone(), *state))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// Decode and apply an encoded stream
    pub async fn receive(&self, name: &VolumeName, data: Bytes) -> Result<ReceiveOutcome> {
        let stream = TransferStream::decode(data)?;
        self.receive_stream(name, stream).await
    }

    /// Apply a decoded stream.
    ///
    /// Rejections (unknown parent, corrupt payload, backend mismatch) leave
    /// the volume exactly as it was. Once the stream is committed the call
    /// succeeds; a failure to record this host as owner is only logged and
    /// is repaired by the next receive or mount.
    pub async fn receive_stream(
        &self,
        name: &VolumeName,
        stream: TransferStream,
    ) -> Result<ReceiveOutcome> {
        if stream.header.backend != self.manager.backend_kind() {
            return Err(Error::Conflict(format!(
                "stream was produced by the {} backend, this node runs {}",
                stream.header.backend,
                self.manager.backend_kind()
            )));
        }

        let lock = self.manager.locks().get(name);
        let _receive = lock.receive.lock().await;
        let token = stream.token().clone();

        let outcome = match self.apply(name, &lock, stream).await? {
            Some(snapshot) => ReceiveOutcome::Committed(snapshot),
            None => {
                debug!("Volume {} already at {}", name, token);
                ReceiveOutcome::AlreadyCurrent(token)
            }
        };

        if let Err(e) = self.record_owner(name).await {
            warn!("Received {} at {} but could not record ownership: {}", name, outcome.token(), e);
        }
        Ok(outcome)
    }

    async fn record_owner(&self, name: &VolumeName) -> Result<()> {
        self.catalog.ensure_volume(name).await?;
        if let Some(previous) = self.catalog.register_active(name, &self.host).await? {
            if previous != self.host {
                info!("Volume {} moved from {} to {}", name, previous, self.host);
            }
        }
        Ok(())
    }

    /// Stage, validate and commit. `None` when the volume already is at the
    /// stream's snapshot.
    async fn apply(
        &self,
        name: &VolumeName,
        lock: &crate::snapshot::VolumeLock,
        stream: TransferStream,
    ) -> Result<Option<SnapshotRef>> {
        {
            let _state = lock.state.read().await;
            let owned = name.clone();
            let current = self
                .manager
                .run_blocking(move |store| store.latest(&owned))
                .await?;
            if current.as_ref() == Some(stream.token()) {
                return Ok(None);
            }
        }

        let progress = StateGuard::new(&self.states, name);
        let stream = Arc::new(stream);

        let staged = {
            let (owned, stream) = (name.clone(), Arc::clone(&stream));
            self.manager
                .run_blocking(move |store| store.stage(&owned, &stream))
                .await?
        };

        let _state = lock.state.write().await;
        progress.set(ReceiveState::Validating);

        let valid = {
            let (owned, stream) = (name.clone(), Arc::clone(&stream));
            self.manager
                .run_blocking(move |store| store.validate(&owned, &stream))
                .await
        };
        if let Err(e) = valid {
            self.manager
                .run_blocking(move |store| {
                    store.discard(&staged);
                    Ok(())
                })
                .await?;
            return Err(e);
        }

        progress.set(ReceiveState::Committing);
        let owned = name.clone();
        let committed = self
            .manager
            .run_blocking(move |store| {
                let snapshot = store.commit(&owned, staged, &stream)?;
                if let Err(e) = store.prune(&owned) {
                    warn!("Failed to prune {} after receive: {}", owned, e);
                }
                Ok(snapshot)
            })
            .await?;

        Ok(Some(committed))
    }
}
