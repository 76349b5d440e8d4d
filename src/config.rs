//! WolfVol Configuration
//!
//! This module provides configuration structures for the WolfVol
//! volume provisioning and transfer daemon.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main WolfVol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfVolConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Storage pool configuration
    pub storage: StorageConfig,

    /// Catalog configuration
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Transfer client configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address other nodes use to reach this node's transfer API.
    /// Written into ownership records as the owning host.
    pub advertise_address: String,
}

/// Snapshot backend used for the storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// btrfs subvolumes, snapshots and send/receive streams
    Btrfs,
    /// Plain directories with copied snapshots (development and tests)
    Plain,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Btrfs => write!(f, "btrfs"),
            BackendKind::Plain => write!(f, "plain"),
        }
    }
}

/// Storage pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the storage pool
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Snapshot backend
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Snapshots retained per volume
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,

    /// Storage guard lock timeout in milliseconds (0 = wait forever)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

/// Catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    /// Catalog database path (defaults to <storage.root>/catalog.db)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Maximum accepted push body in megabytes
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Transfer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/wolfvol")
}

fn default_backend() -> BackendKind {
    BackendKind::Btrfs
}

fn default_keep_snapshots() -> usize {
    8
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_api_address() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_max_body_mb() -> usize {
    4096
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            max_body_mb: default_max_body_mb(),
            cors_enabled: false,
        }
    }
}

impl ApiConfig {
    /// Maximum push body size in bytes
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfVolConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfVolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.advertise_address.is_empty() {
            return Err(crate::Error::Config("node.advertise_address cannot be empty".into()));
        }

        if self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        // The previous snapshot must survive a seal so peers holding it still get diffs
        if self.storage.keep_snapshots < 2 {
            return Err(crate::Error::Config("storage.keep_snapshots must be at least 2".into()));
        }

        Ok(())
    }

    /// Host identity recorded as the owner of active volumes
    pub fn host(&self) -> &str {
        &self.node.advertise_address
    }

    /// Get the storage root path
    pub fn storage_root(&self) -> &PathBuf {
        &self.storage.root
    }

    /// Get the catalog database path
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog
            .path
            .clone()
            .unwrap_or_else(|| self.storage.root.join("catalog.db"))
    }

    /// Storage guard timeout (None = wait forever)
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.storage.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.connect_timeout_secs)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
advertise_address = "10.0.0.1:4000"

[storage]
root = "/srv/wolfvol"
backend = "plain"
keep_snapshots = 4
lock_timeout_ms = 0

[api]
bind_address = "127.0.0.1:4000"
"#;

        let config = WolfVolConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.host(), "10.0.0.1:4000");
        assert_eq!(config.storage.backend, BackendKind::Plain);
        assert_eq!(config.catalog_path(), PathBuf::from("/srv/wolfvol/catalog.db"));
        assert!(config.lock_timeout().is_none());
        assert_eq!(config.api.max_body_mb, 4096);
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_short_retention() {
        let toml = r#"
[node]
id = "node-1"
advertise_address = "10.0.0.1:4000"

[storage]
keep_snapshots = 1
"#;

        assert!(matches!(
            WolfVolConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let toml = r#"
[node]
id = "node-1"
advertise_address = "10.0.0.1:4000"

[storage]
backend = "zfs"
"#;

        assert!(matches!(
            WolfVolConfig::from_str(toml),
            Err(crate::Error::ConfigParse(_))
        ));
    }
}
