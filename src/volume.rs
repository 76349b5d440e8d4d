//! Volume and Snapshot Identity
//!
//! Validated volume names and the order-comparable tokens that identify
//! snapshots in a volume's history.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a volume name
pub const MAX_NAME_LEN: usize = 128;

/// A validated volume name.
///
/// Names are used verbatim as directory names and URL path segments, so only
/// `[A-Za-z0-9._-]` is accepted. Names may not start with `_` (reserved for
/// admin routes) or `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    /// Validate and wrap a volume name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidName(format!(
                "'{}' must be 1-{} characters",
                name, MAX_NAME_LEN
            )));
        }

        if name.starts_with('_') || name.starts_with('.') {
            return Err(Error::InvalidName(format!(
                "'{}' may not start with '_' or '.'",
                name
            )));
        }

        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(Error::InvalidName(format!(
                "'{}' contains invalid character {:?}",
                name, c
            )));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VolumeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for VolumeName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<VolumeName> for String {
    fn from(name: VolumeName) -> Self {
        name.0
    }
}

/// Opaque snapshot token.
///
/// Rendered as `<generation>-<nonce>`: a zero-padded per-volume generation
/// followed by 8 hex characters of randomness. Tokens order by generation, so a
/// greater token is always a descendant in the volume's history. Two snapshots
/// only share a token when one is a received copy of the other, hence equal
/// tokens imply equal content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotToken {
    generation: u64,
    nonce: String,
}

impl SnapshotToken {
    /// Width of the zero-padded generation field
    const GENERATION_WIDTH: usize = 16;

    /// Create the token for the given generation with a fresh nonce
    pub fn next(generation: u64) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self { generation, nonce }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check whether a string is a syntactically valid token
    pub fn is_valid(s: &str) -> bool {
        s.parse::<SnapshotToken>().is_ok()
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0width$}-{}",
            self.generation,
            self.nonce,
            width = Self::GENERATION_WIDTH
        )
    }
}

impl FromStr for SnapshotToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::TransferCorrupt(format!("invalid snapshot token '{}'", s));

        let (generation, nonce) = s.split_once('-').ok_or_else(invalid)?;
        if generation.is_empty() || !generation.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if nonce.len() != 8 || !nonce.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        Ok(Self {
            generation: generation.parse().map_err(|_| invalid())?,
            nonce: nonce.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for SnapshotToken {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SnapshotToken> for String {
    fn from(token: SnapshotToken) -> Self {
        token.to_string()
    }
}

impl Ord for SnapshotToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.nonce.cmp(&other.nonce))
    }
}

impl PartialOrd for SnapshotToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reference to a sealed snapshot on local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    /// Volume the snapshot belongs to
    pub volume: VolumeName,
    /// Snapshot token
    pub token: SnapshotToken,
    /// Path of the read-only snapshot
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_validation() {
        assert!(VolumeName::new("user-1042").is_ok());
        assert!(VolumeName::new("home.template_v2").is_ok());

        assert!(VolumeName::new("").is_err());
        assert!(VolumeName::new("_status").is_err());
        assert!(VolumeName::new(".hidden").is_err());
        assert!(VolumeName::new("a/b").is_err());
        assert!(VolumeName::new("a b").is_err());
        assert!(VolumeName::new("x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_token_roundtrip_and_order() {
        let a = SnapshotToken::next(1);
        let b = SnapshotToken::next(2);
        let c = SnapshotToken::next(10);

        assert!(a < b && b < c);

        let rendered = c.to_string();
        assert!(rendered.starts_with("0000000000000010-"));
        assert_eq!(rendered.parse::<SnapshotToken>().unwrap(), c);

        // Lexical order of rendered tokens matches token order
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn test_token_rejects_garbage() {
        assert!(!SnapshotToken::is_valid("latest"));
        assert!(!SnapshotToken::is_valid("12-xyz"));
        assert!(!SnapshotToken::is_valid("-deadbeef"));
        assert!(!SnapshotToken::is_valid("12-deadbeef00"));
        assert!(SnapshotToken::is_valid("12-deadbeef"));
    }
}
