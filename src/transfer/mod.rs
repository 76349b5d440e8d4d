//! Transfer Module
//!
//! Moving snapshots between nodes: the stream envelope, the receiver that
//! stages and atomically commits inbound streams, and the HTTP client used to
//! pull and push volumes.

mod client;
mod receive;
mod stream;

pub use client::{peer_url, PullOutcome, TransferClient};
pub use receive::{ReceiveOutcome, ReceiveState, Receiver};
pub use stream::{StreamHeader, StreamKind, TransferStream, MAGIC, VERSION};

/// Response header naming the stream kind (`full` or `incremental`)
pub const STREAM_KIND_HEADER: &str = "x-wolfvol-stream";
