//! Catalog
//!
//! Persistent registry of volume ownership and overlay relationships,
//! backed by SQLite. Two tables:
//! - `active_volumes`: which host holds the authoritative writable copy
//! - `volumes`: externally visible volumes, optionally overlaying another
//!
//! Integrity rules (unique names, overlay targets exist, single hop) are
//! checked inside transactions here rather than left to foreign keys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::snapshot::StorageLayout;
use crate::volume::VolumeName;

/// How long a writer waits on a locked database file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ownership record: the host holding the writable copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveVolumeRecord {
    pub volume: VolumeName,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

/// Externally visible volume entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayRecord {
    pub name: VolumeName,
    pub created_at: DateTime<Utc>,
    /// Volume whose storage backs this entry, if it is an overlay
    pub target: Option<VolumeName>,
}

impl OverlayRecord {
    /// The volume whose storage this entry resolves to
    pub fn backing_volume(&self) -> &VolumeName {
        self.target.as_ref().unwrap_or(&self.name)
    }

    pub fn is_overlay(&self) -> bool {
        self.target.is_some()
    }
}

/// Storage indirection of a catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MountTarget {
    /// Backed by the volume's own storage path
    Direct { path: PathBuf },
    /// Backed by another volume
    Overlay { target: VolumeName },
}

/// SQLite-backed catalog
pub struct Catalog {
    conn: Mutex<Connection>,
    layout: StorageLayout,
}

impl Catalog {
    /// Open the catalog, creating the database and schema on first use.
    /// Blocking.
    pub fn open(path: &Path, layout: StorageLayout) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS active_volumes (
                volume TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS volumes (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                target TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_volumes_target
                ON volumes(target);
            "#,
        )?;

        debug!("Opened catalog {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            layout,
        })
    }

    // ============ Ownership ============

    /// Record `host` as the owner of `volume`, replacing any previous owner.
    /// Returns the previous owner.
    pub async fn register_active(&self, volume: &VolumeName, host: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let previous = active_host(&tx, volume)?;
        tx.execute(
            r#"
            INSERT INTO active_volumes (volume, host, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(volume) DO UPDATE SET
                host = excluded.host,
                created_at = CASE WHEN active_volumes.host = excluded.host
                    THEN active_volumes.created_at ELSE excluded.created_at END
            "#,
            params![volume.as_str(), host, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        if previous.as_deref() != Some(host) {
            info!("Volume {} is now active on {}", volume, host);
        }
        Ok(previous)
    }

    /// Drop the ownership record, but only while `host` still holds it.
    /// Returns whether a record was removed.
    pub async fn deregister_active(&self, volume: &VolumeName, host: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM active_volumes WHERE volume = ?1 AND host = ?2",
            params![volume.as_str(), host],
        )?;
        Ok(removed > 0)
    }

    /// Current owner of a volume
    pub async fn active_owner(&self, volume: &VolumeName) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        active_host(&conn, volume)
    }

    /// All ownership records, by volume name
    pub async fn list_active(&self) -> Result<Vec<ActiveVolumeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT volume, host, created_at FROM active_volumes ORDER BY volume",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(volume, host, created_at)| {
                Ok(ActiveVolumeRecord {
                    volume: stored_name(volume)?,
                    host,
                    created_at: stored_time(&created_at)?,
                })
            })
            .collect()
    }

    // ============ Volume registry ============

    /// Register a volume, as an overlay of `target` when given
    pub async fn register_volume(
        &self,
        name: &VolumeName,
        target: Option<&VolumeName>,
    ) -> Result<OverlayRecord> {
        if target == Some(name) {
            return Err(Error::Conflict(format!("volume {} cannot overlay itself", name)));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        if fetch_volume(&tx, name)?.is_some() {
            return Err(Error::Conflict(format!("volume {} is already registered", name)));
        }

        if let Some(target) = target {
            match fetch_volume(&tx, target)? {
                None => {
                    return Err(Error::NotFound(format!("overlay target {}", target)));
                }
                Some(record) if record.is_overlay() => {
                    return Err(Error::Conflict(format!(
                        "overlay target {} is itself an overlay",
                        target
                    )));
                }
                Some(_) => {}
            }
        }

        let record = OverlayRecord {
            name: name.clone(),
            created_at: Utc::now(),
            target: target.cloned(),
        };
        tx.execute(
            "INSERT INTO volumes (name, created_at, target) VALUES (?1, ?2, ?3)",
            params![
                record.name.as_str(),
                record.created_at.to_rfc3339(),
                record.target.as_ref().map(|t| t.as_str())
            ],
        )?;
        tx.commit()?;

        Ok(record)
    }

    /// Register a direct volume unless an entry already exists
    pub async fn ensure_volume(&self, name: &VolumeName) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO volumes (name, created_at, target) VALUES (?1, ?2, NULL)",
            params![name.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn get_volume(&self, name: &VolumeName) -> Result<Option<OverlayRecord>> {
        let conn = self.conn.lock().await;
        fetch_volume(&conn, name)
    }

    /// All registered volumes, by name
    pub async fn list_volumes(&self) -> Result<Vec<OverlayRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name, created_at, target FROM volumes ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, created_at, target)| overlay_record(name, &created_at, target))
            .collect()
    }

    /// Remove a volume entry and its ownership record.
    /// Fails with `Conflict` while overlays still point at it.
    pub async fn remove_volume(&self, name: &VolumeName) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        if fetch_volume(&tx, name)?.is_none() {
            return Err(Error::NotFound(format!("volume {}", name)));
        }

        let overlays: i64 = tx.query_row(
            "SELECT COUNT(*) FROM volumes WHERE target = ?1",
            params![name.as_str()],
            |row| row.get(0),
        )?;
        if overlays > 0 {
            return Err(Error::Conflict(format!(
                "volume {} is still the target of {} overlay(s)",
                name, overlays
            )));
        }

        tx.execute("DELETE FROM volumes WHERE name = ?1", params![name.as_str()])?;
        tx.execute(
            "DELETE FROM active_volumes WHERE volume = ?1",
            params![name.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Storage indirection of an entry
    pub async fn mount_target(&self, name: &VolumeName) -> Result<MountTarget> {
        let record = self
            .get_volume(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume {}", name)))?;

        Ok(match record.target {
            Some(target) => MountTarget::Overlay { target },
            None => MountTarget::Direct {
                path: self.layout.volume_dir(name),
            },
        })
    }

    /// Path to mount for `name`, following at most one overlay hop.
    /// Never mutates the catalog.
    pub async fn resolve_mountpoint(&self, name: &VolumeName) -> Result<PathBuf> {
        Ok(match self.mount_target(name).await? {
            MountTarget::Direct { .. } => self.layout.mountpoint(name),
            MountTarget::Overlay { target } => self.layout.mountpoint(&target),
        })
    }
}

fn active_host(conn: &Connection, volume: &VolumeName) -> Result<Option<String>> {
    let result: std::result::Result<String, _> = conn.query_row(
        "SELECT host FROM active_volumes WHERE volume = ?1",
        params![volume.as_str()],
        |row| row.get(0),
    );

    match result {
        Ok(host) => Ok(Some(host)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn fetch_volume(conn: &Connection, name: &VolumeName) -> Result<Option<OverlayRecord>> {
    let result: std::result::Result<(String, Option<String>), _> = conn.query_row(
        "SELECT created_at, target FROM volumes WHERE name = ?1",
        params![name.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    );

    match result {
        Ok((created_at, target)) => {
            Ok(Some(overlay_record(name.to_string(), &created_at, target)?))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn overlay_record(name: String, created_at: &str, target: Option<String>) -> Result<OverlayRecord> {
    Ok(OverlayRecord {
        name: stored_name(name)?,
        created_at: stored_time(created_at)?,
        target: target.map(stored_name).transpose()?,
    })
}

fn stored_name(name: String) -> Result<VolumeName> {
    VolumeName::new(name).map_err(|e| Error::Catalog(format!("corrupt volume name: {}", e)))
}

fn stored_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Catalog(format!("corrupt timestamp '{}': {}", value, e)))
}
