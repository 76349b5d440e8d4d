//! Transfer stream envelope
//!
//! ```text
//! magic        [8]   b"WOLFVOL1"
//! version      u32
//! backend      u8    0 = btrfs, 1 = plain
//! kind         u8    0 = full, 1 = incremental
//! token_len    u16
//! token        [token_len]
//! parent_len   u16   0 for full streams
//! parent       [parent_len]
//! payload_len  u64
//! checksum     u32   CRC32 of payload
//! payload      [payload_len]
//! ```
//!
//! Integers are little-endian. The payload is whatever the backend's `send`
//! produced.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::volume::SnapshotToken;

/// Stream magic bytes
pub const MAGIC: &[u8; 8] = b"WOLFVOL1";

/// Envelope format version
pub const VERSION: u32 = 1;

/// Fixed-size part of the envelope
const FIXED_LEN: usize = 8 + 4 + 1 + 1 + 2 + 2 + 8 + 4;

/// Full or incremental
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// Complete snapshot
    Full,
    /// Diff against a parent snapshot the receiver must already hold
    Incremental { parent: SnapshotToken },
}

/// Decoded envelope header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub backend: BackendKind,
    pub kind: StreamKind,
    pub token: SnapshotToken,
}

/// A snapshot serialized for transfer
#[derive(Debug, Clone)]
pub struct TransferStream {
    pub header: StreamHeader,
    pub payload: Bytes,
}

impl TransferStream {
    pub fn new(
        backend: BackendKind,
        kind: StreamKind,
        token: SnapshotToken,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: StreamHeader {
                backend,
                kind,
                token,
            },
            payload: payload.into(),
        }
    }

    /// Token of the snapshot this stream recreates
    pub fn token(&self) -> &SnapshotToken {
        &self.header.token
    }

    /// Parent token for incremental streams
    pub fn parent(&self) -> Option<&SnapshotToken> {
        match &self.header.kind {
            StreamKind::Full => None,
            StreamKind::Incremental { parent } => Some(parent),
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.parent().is_some()
    }

    /// Serialize the envelope and payload
    pub fn encode(&self) -> Result<Bytes> {
        let token = self.header.token.to_string();
        let parent = self.parent().map(|p| p.to_string()).unwrap_or_default();

        let mut buf = Vec::with_capacity(FIXED_LEN + token.len() + parent.len() + self.payload.len());
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<LittleEndian>(VERSION)?;
        buf.write_u8(backend_code(self.header.backend))?;
        buf.write_u8(if self.is_incremental() { 1 } else { 0 })?;
        buf.write_u16::<LittleEndian>(token.len() as u16)?;
        buf.extend_from_slice(token.as_bytes());
        buf.write_u16::<LittleEndian>(parent.len() as u16)?;
        buf.extend_from_slice(parent.as_bytes());
        buf.write_u64::<LittleEndian>(self.payload.len() as u64)?;
        buf.write_u32::<LittleEndian>(crc32fast::hash(&self.payload))?;
        buf.extend_from_slice(&self.payload);

        Ok(Bytes::from(buf))
    }

    /// Parse and verify an encoded stream. The payload is sliced out of
    /// `data` without copying.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(&data[..]);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(Error::TransferCorrupt("bad magic".into()));
        }

        let version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != VERSION {
            return Err(Error::TransferCorrupt(format!(
                "unsupported stream version {}",
                version
            )));
        }

        let backend = match cursor.read_u8().map_err(truncated)? {
            0 => BackendKind::Btrfs,
            1 => BackendKind::Plain,
            other => {
                return Err(Error::TransferCorrupt(format!("unknown backend {}", other)));
            }
        };
        let kind_code = cursor.read_u8().map_err(truncated)?;

        let token: SnapshotToken = read_string(&mut cursor)?.parse()?;
        let parent = read_string(&mut cursor)?;

        let kind = match (kind_code, parent.is_empty()) {
            (0, true) => StreamKind::Full,
            (1, false) => StreamKind::Incremental {
                parent: parent.parse()?,
            },
            (0, false) => {
                return Err(Error::TransferCorrupt("full stream carries a parent".into()));
            }
            (1, true) => {
                return Err(Error::TransferCorrupt("incremental stream without parent".into()));
            }
            (other, _) => {
                return Err(Error::TransferCorrupt(format!("unknown stream kind {}", other)));
            }
        };

        let payload_len = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let checksum = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let start = cursor.position() as usize;
        let remaining = (data.len() - start) as u64;
        if remaining < payload_len {
            return Err(Error::TransferCorrupt(format!(
                "truncated payload: expected {} bytes, got {}",
                payload_len, remaining
            )));
        }
        if remaining > payload_len {
            return Err(Error::TransferCorrupt(format!(
                "{} trailing bytes after payload",
                remaining - payload_len
            )));
        }

        let payload = data.slice(start..);
        if crc32fast::hash(&payload) != checksum {
            return Err(Error::TransferCorrupt("payload checksum mismatch".into()));
        }

        Ok(Self {
            header: StreamHeader {
                backend,
                kind,
                token,
            },
            payload,
        })
    }
}

fn backend_code(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::Btrfs => 0,
        BackendKind::Plain => 1,
    }
}

fn truncated(_: std::io::Error) -> Error {
    Error::TransferCorrupt("truncated header".into())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut raw = vec![0u8; len];
    cursor.read_exact(&mut raw).map_err(truncated)?;
    String::from_utf8(raw).map_err(|_| Error::TransferCorrupt("token is not UTF-8".into()))
}
