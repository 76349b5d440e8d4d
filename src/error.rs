//! WolfVol Error Types

use thiserror::Error;

/// Result type alias for WolfVol operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfVol error types
#[derive(Error, Debug)]
pub enum Error {
    // Volume and snapshot errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot expired: {0}")]
    Expired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid volume name: {0}")]
    InvalidName(String),

    // Transfer errors
    #[error("Transfer stream corrupt: {0}")]
    TransferCorrupt(String),

    #[error("Transfer serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Storage errors
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage backend command failed: {0}")]
    Backend(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Catalog errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable without any change on the caller's side
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Network(_) | Error::Expired(_)
        )
    }

    /// Errors that are reported back to a transfer caller as a rejection.
    /// Operations failing with one of these have not mutated any volume.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Conflict(_)
                | Error::TransferCorrupt(_)
                | Error::InvalidName(_)
        )
    }

    /// Errors that must stop the daemon before it starts serving
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::Timeout(_) | Error::Config(_) | Error::ConfigParse(_)
        )
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Expired(_) => "EXPIRED",
            Error::Conflict(_) => "CONFLICT",
            Error::InvalidName(_) => "INVALID_NAME",
            Error::TransferCorrupt(_) | Error::Serialization(_) => "TRANSFER_CORRUPT",
            Error::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Error::Backend(_) => "BACKEND_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Catalog(_) => "CATALOG_ERROR",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Catalog(format!("SQLite error: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::Conflict("parent".into()).is_rejection());
        assert!(Error::TransferCorrupt("magic".into()).is_rejection());
        assert!(!Error::Io(std::io::Error::other("disk")).is_rejection());

        assert!(Error::StorageUnavailable("not btrfs".into()).is_fatal());
        assert!(Error::Timeout("lock".into()).is_fatal());
        assert!(!Error::NotFound("vol".into()).is_fatal());

        assert!(Error::Expired("tok".into()).is_retryable());
        assert_eq!(Error::Expired("tok".into()).code(), "EXPIRED");
    }
}
