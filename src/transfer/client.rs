//! HTTP transfer client
//!
//! Pulls streams from and pushes streams to the transfer API of other nodes.

use std::time::Duration;

use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::volume::{SnapshotToken, VolumeName};

use super::stream::TransferStream;

/// Result of a pull
#[derive(Debug)]
pub enum PullOutcome {
    /// The peer's current snapshot is the one we already have
    NotModified,
    /// A stream to apply locally
    Stream(TransferStream),
}

#[derive(Debug, Deserialize)]
struct SnapshotList {
    snapshots: Vec<SnapshotToken>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for other nodes' transfer APIs
#[derive(Clone)]
pub struct TransferClient {
    http: reqwest::Client,
}

impl TransferClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Fetch `name` from `peer`.
    ///
    /// `known` lists snapshots held locally so the peer can send a diff;
    /// `if_none_match` is the local current snapshot.
    pub async fn pull(
        &self,
        peer: &str,
        name: &VolumeName,
        known: &[SnapshotToken],
        if_none_match: Option<&SnapshotToken>,
    ) -> Result<PullOutcome> {
        let query: Vec<(&str, String)> = known.iter().map(|t| ("from", t.to_string())).collect();
        let mut request = self
            .http
            .get(peer_url(peer, &format!("/{}", name)))
            .query(&query);
        if let Some(token) = if_none_match {
            request = request.header(header::IF_NONE_MATCH, format!("\"{}\"", token));
        }

        let response = request.send().await.map_err(network_error)?;
        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("{} on {} unchanged", name, peer);
                Ok(PullOutcome::NotModified)
            }
            StatusCode::OK => {
                let body = response.bytes().await.map_err(network_error)?;
                let stream = TransferStream::decode(body)?;
                info!(
                    "Pulled {} at {} from {} ({} bytes)",
                    name,
                    stream.token(),
                    peer,
                    stream.payload.len()
                );
                Ok(PullOutcome::Stream(stream))
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Send a stream to `peer`. Returns the peer's confirmation message.
    pub async fn push(&self, peer: &str, name: &VolumeName, stream: &TransferStream) -> Result<String> {
        let body = stream.encode()?;
        let response = self
            .http
            .put(peer_url(peer, &format!("/{}", name)))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::OK => response.text().await.map_err(network_error),
            StatusCode::BAD_REQUEST => {
                let reason = response.text().await.map_err(network_error)?;
                Err(Error::Conflict(format!("{} rejected {}: {}", peer, name, reason.trim())))
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Snapshots `peer` holds for `name`, oldest first
    pub async fn history(&self, peer: &str, name: &VolumeName) -> Result<Vec<SnapshotToken>> {
        let response = self
            .http
            .get(peer_url(peer, &format!("/_snapshots/{}", name)))
            .send()
            .await
            .map_err(network_error)?;

        if response.status() != StatusCode::OK {
            return Err(error_from_response(response).await);
        }
        let list: SnapshotList = response.json().await.map_err(network_error)?;
        Ok(list.snapshots)
    }

    /// Move `name` from one node to another, incrementally when the
    /// destination already holds an older snapshot
    pub async fn migrate(&self, from: &str, to: &str, name: &VolumeName) -> Result<SnapshotToken> {
        let known = match self.history(to, name).await {
            Ok(known) => known,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let stream = match self.pull(from, name, &known, None).await? {
            PullOutcome::Stream(stream) => stream,
            PullOutcome::NotModified => {
                return Err(Error::Internal(format!(
                    "{} answered not-modified without a precondition",
                    from
                )));
            }
        };

        let token = stream.token().clone();
        let message = self.push(to, name, &stream).await?;
        info!("Migrated {} from {} to {}: {}", name, from, to, message.trim());
        Ok(token)
    }
}

/// Base URL for a peer given as `host:port` or a full URL
pub fn peer_url(peer: &str, path: &str) -> String {
    let base = peer.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    }
}

fn network_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("transfer request timed out: {}", e))
    } else {
        Error::Network(e.to_string())
    }
}

/// Map a peer's error response back onto our error kinds
async fn error_from_response(response: reqwest::Response) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);

    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::GONE => Error::Expired(message),
        StatusCode::CONFLICT => Error::Conflict(message),
        StatusCode::BAD_REQUEST => Error::TransferCorrupt(message),
        StatusCode::SERVICE_UNAVAILABLE => Error::StorageUnavailable(message),
        StatusCode::GATEWAY_TIMEOUT => Error::Timeout(message),
        _ => Error::Network(format!("peer returned {}: {}", status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url() {
        assert_eq!(peer_url("10.0.0.2:4000", "/alice"), "http://10.0.0.2:4000/alice");
        assert_eq!(
            peer_url("https://storage-2.internal/", "/_snapshots/alice"),
            "https://storage-2.internal/_snapshots/alice"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let client = TransferClient::new(Duration::from_millis(200), Duration::from_secs(1)).unwrap();
        let name = VolumeName::new("alice").unwrap();

        // Port 1 on localhost refuses connections
        let result = client.pull("127.0.0.1:1", &name, &[], None).await;
        assert!(matches!(result, Err(Error::Network(_)) | Err(Error::Timeout(_))));
    }
}
