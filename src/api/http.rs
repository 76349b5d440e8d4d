//! HTTP API Server
//!
//! Transfer protocol (`GET`/`PUT` on `/:volume`) plus the admin and
//! lifecycle endpoints under the reserved `_` prefix.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::catalog::{Catalog, OverlayRecord};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::lifecycle::VolumeLifecycle;
use crate::snapshot::SnapshotManager;
use crate::transfer::{ReceiveOutcome, ReceiveState, Receiver, StreamKind, STREAM_KIND_HEADER};
use crate::volume::{SnapshotToken, VolumeName};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Host identity recorded in ownership records
    pub host: String,
    pub manager: SnapshotManager,
    pub receiver: Receiver,
    pub catalog: Arc<Catalog>,
    pub lifecycle: VolumeLifecycle,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Build the router with all layers applied
    pub fn router(&self) -> Router {
        let router = Self::create_router(Arc::clone(&self.state))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes()))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Admin and lifecycle
            .route("/_health", get(handle_health))
            .route("/_status", get(handle_status))
            .route("/_snapshots/:volume", get(handle_snapshots))
            .route("/_volumes", get(handle_list_volumes).post(handle_create_volume))
            .route("/_volumes/:volume", delete(handle_remove_volume))
            .route("/_volumes/:volume/mount", post(handle_mount))
            .route("/_volumes/:volume/unmount", post(handle_unmount))
            // Transfer protocol
            .route("/:volume", get(handle_pull).put(handle_push))
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub host: String,
    pub backend: String,
    pub volumes: usize,
    pub active_here: usize,
    pub receives: Vec<ReceiveStatus>,
    pub uptime_seconds: u64,
}

/// One in-flight receive
#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveStatus {
    pub volume: String,
    pub state: String,
}

/// Snapshot history of a volume
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotListResponse {
    pub volume: String,
    pub current: Option<String>,
    pub snapshots: Vec<String>,
}

/// One catalog entry with its owner
#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub name: String,
    pub target: Option<String>,
    pub created_at: String,
    pub owner: Option<String>,
}

/// Create request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub overlay_target: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/// Mount request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MountRequest {
    /// Peer to pull the volume from, overriding the recorded owner
    #[serde(default)]
    pub from: Option<String>,
}

/// Mount response
#[derive(Debug, Serialize, Deserialize)]
pub struct MountResponse {
    pub name: String,
    pub mountpoint: String,
}

/// Unmount response
#[derive(Debug, Serialize, Deserialize)]
pub struct UnmountResponse {
    pub name: String,
    pub token: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping crate errors onto HTTP status codes
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Expired(_) => StatusCode::GONE,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidName(_) | Error::TransferCorrupt(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Transfer protocol ============

/// `GET /:volume[?from=<token>]*`
///
/// Seals (or reuses) the current state and returns it as a stream, diffed
/// against the newest `from` token this node holds. Answers `304` when the
/// caller's `If-None-Match` already names the current snapshot.
async fn handle_pull(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let name = VolumeName::new(volume)?;
    let known = params
        .iter()
        .filter(|(key, _)| key == "from")
        .map(|(_, value)| value.parse::<SnapshotToken>())
        .collect::<Result<Vec<_>>>()?;

    let sealed = state.manager.seal(&name).await?;
    let etag = format!("\"{}\"", sealed.token);

    if if_none_match(&headers, &sealed.token) {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    let stream = state
        .manager
        .produce_stream(&name, &sealed.token, &known)
        .await?;
    let kind = match stream.header.kind {
        StreamKind::Full => "full",
        StreamKind::Incremental { .. } => "incremental",
    };
    let body = stream.encode()?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::ETAG, header_value(&etag)?),
            (
                HeaderName::from_static(STREAM_KIND_HEADER),
                HeaderValue::from_static(kind),
            ),
        ],
        body,
    )
        .into_response())
}

/// `PUT /:volume`
///
/// Applies a stream. Any rejection answers `400` with the reason and leaves
/// the volume untouched.
async fn handle_push(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
    body: Bytes,
) -> Response {
    let name = match VolumeName::new(volume) {
        Ok(name) => name,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match state.receiver.receive(&name, body).await {
        Ok(ReceiveOutcome::Committed(snapshot)) => (
            StatusCode::OK,
            format!("committed {} at {}\n", name, snapshot.token),
        )
            .into_response(),
        Ok(ReceiveOutcome::AlreadyCurrent(token)) => {
            (StatusCode::OK, format!("{} already at {}\n", name, token)).into_response()
        }
        Err(e) if e.is_rejection() => {
            info!("Rejected push of {}: {}", name, e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Does `If-None-Match` name `token` (or `*`)?
fn if_none_match(headers: &HeaderMap, token: &SnapshotToken) -> bool {
    let current = token.to_string();
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|tag| tag == "*" || tag == current)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Internal(format!("bad header value: {}", e)))
}

// ============ Admin ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let volumes = state.manager.list_volumes().await?;
    let active_here = state
        .catalog
        .list_active()
        .await?
        .iter()
        .filter(|record| record.host == state.host)
        .count();
    let receives = state
        .receiver
        .in_flight()
        .into_iter()
        .filter(|(_, s)| *s != ReceiveState::Idle)
        .map(|(volume, s)| ReceiveStatus {
            volume: volume.to_string(),
            state: format!("{:?}", s).to_lowercase(),
        })
        .collect();

    Ok(Json(StatusResponse {
        node_id: state.node_id.clone(),
        host: state.host.clone(),
        backend: state.manager.backend_kind().to_string(),
        volumes: volumes.len(),
        active_here,
        receives,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}

async fn handle_snapshots(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
) -> ApiResult<Json<SnapshotListResponse>> {
    let name = VolumeName::new(volume)?;
    let history = state.manager.history(&name).await?;

    Ok(Json(SnapshotListResponse {
        volume: name.to_string(),
        current: history.last().map(|t| t.to_string()),
        snapshots: history.iter().map(|t| t.to_string()).collect(),
    }))
}

async fn handle_list_volumes(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<VolumeEntry>>> {
    let records = state.lifecycle.list().await?;
    let active = state.catalog.list_active().await?;

    let entries = records
        .into_iter()
        .map(|record| {
            let owner = active
                .iter()
                .find(|a| &a.volume == record.backing_volume())
                .map(|a| a.host.clone());
            volume_entry(record, owner)
        })
        .collect();
    Ok(Json(entries))
}

async fn handle_create_volume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = VolumeName::new(req.name)?;
    let overlay_target = req.overlay_target.map(VolumeName::new).transpose()?;
    let template = req.template.map(VolumeName::new).transpose()?;

    let record = state
        .lifecycle
        .create(&name, overlay_target.as_ref(), template.as_ref())
        .await?;
    let owner = state.catalog.active_owner(record.backing_volume()).await?;
    Ok((StatusCode::CREATED, Json(volume_entry(record, owner))))
}

async fn handle_mount(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
    body: Option<Json<MountRequest>>,
) -> ApiResult<Json<MountResponse>> {
    let name = VolumeName::new(volume)?;
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let mountpoint = state.lifecycle.mount(&name, req.from.as_deref()).await?;
    Ok(Json(MountResponse {
        name: name.to_string(),
        mountpoint: mountpoint.display().to_string(),
    }))
}

async fn handle_unmount(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
) -> ApiResult<Json<UnmountResponse>> {
    let name = VolumeName::new(volume)?;
    let sealed = state.lifecycle.unmount(&name).await?;
    Ok(Json(UnmountResponse {
        name: name.to_string(),
        token: sealed.token.to_string(),
    }))
}

async fn handle_remove_volume(
    State(state): State<Arc<AppState>>,
    Path(volume): Path<String>,
) -> ApiResult<StatusCode> {
    let name = VolumeName::new(volume)?;
    state.lifecycle.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn volume_entry(record: OverlayRecord, owner: Option<String>) -> VolumeEntry {
    VolumeEntry {
        name: record.name.to_string(),
        target: record.target.map(|t| t.to_string()),
        created_at: record.created_at.to_rfc3339(),
        owner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{PlainBackend, StorageLayout};
    use crate::transfer::{TransferClient, TransferStream};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct TestNode {
        dir: TempDir,
        server: HttpServer,
    }

    impl TestNode {
        fn state(&self) -> Arc<AppState> {
            self.server.state()
        }

        async fn call(&self, request: Request<Body>) -> Response {
            self.server.router().oneshot(request).await.unwrap()
        }

        fn write(&self, volume: &str, file: &str, data: &str) {
            let name = VolumeName::new(volume).unwrap();
            std::fs::write(self.state().manager.mountpoint(&name).join(file), data).unwrap();
        }
    }

    fn test_node(host: &str) -> TestNode {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        let catalog = Arc::new(Catalog::open(&dir.path().join("catalog.db"), layout.clone()).unwrap());
        let manager = SnapshotManager::new(layout, Arc::new(PlainBackend::new()), 4);
        let receiver = Receiver::new(manager.clone(), Arc::clone(&catalog), host);
        let client = TransferClient::new(Duration::from_secs(1), Duration::from_secs(10)).unwrap();
        let lifecycle = VolumeLifecycle::new(
            manager.clone(),
            Arc::clone(&catalog),
            receiver.clone(),
            client,
            host,
        );

        let state = AppState {
            node_id: format!("node-{}", host),
            host: host.to_string(),
            manager,
            receiver,
            catalog,
            lifecycle,
            started_at: Instant::now(),
        };
        TestNode {
            dir,
            server: HttpServer::new(ApiConfig::default(), state),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put(uri: &str, body: Bytes) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    fn etag(response: &Response) -> String {
        response.headers()[header::ETAG].to_str().unwrap().to_string()
    }

    async fn body(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_is_stable_and_conditional() {
        let node = test_node("a");
        let name = VolumeName::new("alice").unwrap();
        node.state().manager.create_volume(&name, None).await.unwrap();
        node.write("alice", "notes", "hello");

        let first = node.call(get("/alice")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[STREAM_KIND_HEADER], "full");
        let tag = etag(&first);

        let second = node.call(get("/alice")).await;
        assert_eq!(etag(&second), tag);

        let conditional = node
            .call(
                Request::builder()
                    .uri("/alice")
                    .header(header::IF_NONE_MATCH, &tag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(etag(&conditional), tag);
        assert!(body(conditional).await.is_empty());
    }

    #[tokio::test]
    async fn test_push_round_trip_over_http() {
        let source = test_node("a");
        let dest = test_node("b");
        let name = VolumeName::new("alice").unwrap();
        source.state().manager.create_volume(&name, None).await.unwrap();
        source.write("alice", "a", "1");

        let full = source.call(get("/alice")).await;
        let t1 = etag(&full);
        let pushed = dest.call(put("/alice", body(full).await)).await;
        assert_eq!(pushed.status(), StatusCode::OK);

        source.write("alice", "b", "2");
        let from = t1.trim_matches('"');
        let diff = source.call(get(&format!("/alice?from={}", from))).await;
        assert_eq!(diff.headers()[STREAM_KIND_HEADER], "incremental");
        let t2 = etag(&diff);
        let pushed = dest.call(put("/alice", body(diff).await)).await;
        assert_eq!(pushed.status(), StatusCode::OK);

        // The receiver now reports the sender's token
        let check = dest.call(get("/alice")).await;
        assert_eq!(etag(&check), t2);

        let snapshots = dest.call(get("/_snapshots/alice")).await;
        let list: SnapshotListResponse = serde_json::from_slice(&body(snapshots).await).unwrap();
        assert_eq!(list.snapshots.len(), 2);
        assert_eq!(format!("\"{}\"", list.current.unwrap()), t2);
    }

    #[tokio::test]
    async fn test_rejected_push_leaves_volume_unchanged() {
        let source = test_node("a");
        let dest = test_node("b");
        let name = VolumeName::new("alice").unwrap();

        source.state().manager.create_volume(&name, None).await.unwrap();
        source.write("alice", "a", "1");
        let t1 = source.state().manager.seal(&name).await.unwrap().token;
        source.write("alice", "a", "2");
        let t2 = source.state().manager.seal(&name).await.unwrap().token;
        let diff = source
            .state()
            .manager
            .produce_stream(&name, &t2, &[t1])
            .await
            .unwrap();

        dest.state().manager.create_volume(&name, None).await.unwrap();
        dest.write("alice", "mine", "local");
        let before = etag(&dest.call(get("/alice")).await);

        let rejected = dest.call(put("/alice", diff.encode().unwrap())).await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        assert_eq!(etag(&dest.call(get("/alice")).await), before);

        let garbage = dest.call(put("/alice", Bytes::from_static(b"garbage"))).await;
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(etag(&dest.call(get("/alice")).await), before);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let node = test_node("a");

        assert_eq!(node.call(get("/ghost")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(node.call(get("/_snapshots/ghost")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(node.call(get("/bad%20name")).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            node.call(get("/alice?from=not-a-token")).await.status(),
            StatusCode::BAD_REQUEST
        );

        let name = VolumeName::new("alice").unwrap();
        node.state().manager.create_volume(&name, None).await.unwrap();
        let stale = SnapshotToken::next(1);
        let response = node.call(get(&format!("/alice?from={}", stale))).await;
        // Unknown `from` tokens fall back to a full stream
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[STREAM_KIND_HEADER], "full");
        let stream = TransferStream::decode(body(response).await).unwrap();
        assert!(!stream.is_incremental());
    }

    #[tokio::test]
    async fn test_polling_absent_volumes_keeps_no_locks() {
        let node = test_node("a");

        for i in 0..300 {
            let response = node.call(get(&format!("/ghost-{}", i))).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let rejected = node.call(put("/ghost-0", Bytes::from_static(b"garbage"))).await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        assert_eq!(node.state().manager.locks().len(), 0);
    }

    #[tokio::test]
    async fn test_admin_lifecycle() {
        let node = test_node("a");

        let create = Request::builder()
            .method("POST")
            .uri("/_volumes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"base"}"#))
            .unwrap();
        assert_eq!(node.call(create).await.status(), StatusCode::CREATED);

        let overlay = Request::builder()
            .method("POST")
            .uri("/_volumes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"user-1","overlay_target":"base"}"#))
            .unwrap();
        assert_eq!(node.call(overlay).await.status(), StatusCode::CREATED);

        let mount = Request::builder()
            .method("POST")
            .uri("/_volumes/user-1/mount")
            .body(Body::empty())
            .unwrap();
        let mounted: MountResponse = serde_json::from_slice(&body(node.call(mount).await).await).unwrap();
        let base = VolumeName::new("base").unwrap();
        assert_eq!(
            mounted.mountpoint,
            node.state().manager.mountpoint(&base).display().to_string()
        );

        let listed: Vec<VolumeEntry> =
            serde_json::from_slice(&body(node.call(get("/_volumes")).await).await).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|v| v.owner.as_deref() == Some("a")));

        let unmount = Request::builder()
            .method("POST")
            .uri("/_volumes/base/unmount")
            .body(Body::empty())
            .unwrap();
        assert_eq!(node.call(unmount).await.status(), StatusCode::OK);

        let remove_base = Request::builder()
            .method("DELETE")
            .uri("/_volumes/base")
            .body(Body::empty())
            .unwrap();
        assert_eq!(node.call(remove_base).await.status(), StatusCode::CONFLICT);

        let status: StatusResponse =
            serde_json::from_slice(&body(node.call(get("/_status")).await).await).unwrap();
        assert_eq!(status.volumes, 1);
        assert_eq!(status.backend, "plain");
        assert!(status.receives.is_empty());
        assert!(node.dir.path().join("catalog.db").exists());
    }

    #[tokio::test]
    async fn test_mount_pulls_from_owner() {
        let owner = test_node("a");
        let name = VolumeName::new("alice").unwrap();
        owner.state().manager.create_volume(&name, None).await.unwrap();
        owner.write("alice", "data", "from the owner");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = owner.server.router();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let local = test_node("b");
        let path = local
            .state()
            .lifecycle
            .mount(&name, Some(&addr))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path.join("data")).unwrap(), "from the owner");
        assert_eq!(
            local.state().catalog.active_owner(&name).await.unwrap().as_deref(),
            Some("b")
        );

        // Second mount is a conditional pull answered with 304
        let again = local.state().lifecycle.mount(&name, Some(&addr)).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(local.state().manager.history(&name).await.unwrap().len(), 1);
    }
}
