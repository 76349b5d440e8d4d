//! HTTP API Module
//!
//! Serves the transfer protocol to peers and the admin endpoints used by
//! `wolfvolctl` and volume plugins.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer, MountRequest, StatusResponse};
