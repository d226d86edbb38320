#![forbid(unsafe_code)]

//! Axum front end for the media root.
//!
//! Every route except `/health` and the public stream sits behind the
//! credential check. Handlers stay thin: they extract parameters, call into
//! [`MediaService`] and translate [`MediaError`] into JSON.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, Query, State,
        multipart::MultipartError, rejection::QueryRejection,
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use clap::Parser;
use mediafs::{
    catalog::{FileSummary, FrameKind, MediaSummary},
    config::{RuntimeOverrides, resolve_runtime_config},
    error::MediaError,
    files::FileEntry,
    playlist::Playlist,
    range,
    security::ensure_not_root,
    service::MediaService,
    signing::{LinkParams, PUBLIC_STREAM_ROUTE, PublicLink},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "mediafs=info,tower_http=info";
const FRAME_CACHE_CONTROL: &str = "public, max-age=86400";
/// Chunks are buffered whole before they reach the disk.
const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "mediafs", about = "Serve HLS assets from a media root")]
struct Args {
    /// Directory holding the media assets (overrides MEDIA_ROOT).
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Origin used when building public links.
    #[arg(long)]
    public_base_url: Option<String>,
    /// Alternate `.env` file.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            host: self.host,
            port: self.port,
            public_base_url: self.public_base_url,
            env_path: self.env_file,
        }
    }
}

/// Decides whether a request may reach the private routes.
trait CredentialVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap) -> bool;
}

/// Accepts `Authorization: Bearer <token>` for a single shared token.
struct BearerTokenVerifier {
    token: String,
}

impl BearerTokenVerifier {
    fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialVerifier for BearerTokenVerifier {
    fn verify(&self, headers: &HeaderMap) -> bool {
        let Some(presented) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
        else {
            return false;
        };
        constant_time_eq(presented.trim().as_bytes(), self.token.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
struct AppState {
    service: Arc<MediaService>,
    verifier: Arc<dyn CredentialVerifier>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    /// Extra top-level fields merged into the JSON body.
    details: Map<String, Value>,
    /// Set for 416 answers, which carry no JSON body.
    unsatisfiable_size: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Map::new(),
            unsatisfiable_size: None,
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        let status = err.status();
        match err {
            MediaError::PathViolation => Self::new(status, "forbidden"),
            MediaError::RangeNotSatisfiable { size } => Self {
                unsatisfiable_size: Some(size),
                ..Self::new(status, "range not satisfiable")
            },
            MediaError::InvalidRange {
                from,
                to,
                segment_count,
            } => {
                let mut error = Self::new(status, "invalid segment range");
                error.details.insert("from".into(), json!(from));
                error.details.insert("to".into(), json!(to));
                error
                    .details
                    .insert("segmentCount".into(), json!(segment_count));
                error
            }
            // The path would reveal the root layout.
            MediaError::InvalidFormat { reason, .. } => {
                Self::new(status, format!("invalid playlist: {reason}"))
            }
            MediaError::ProbeUnavailable(detail) => {
                tracing::warn!(error = %detail, "probe unavailable");
                Self::new(status, "media probe unavailable")
            }
            MediaError::Io(io) => {
                tracing::error!(error = %io, "I/O failure");
                Self::new(status, "internal error")
            }
            other => Self::new(status, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(size) = self.unsatisfiable_size {
            return range::not_satisfiable(size);
        }
        let mut body = self.details;
        body.insert("error".into(), Value::String(self.message));
        (self.status, Json(Value::Object(body))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    ensure_not_root("mediafs")?;

    let config = resolve_runtime_config(args.into_overrides())?;
    let service = MediaService::from_config(&config)?;
    let state = AppState {
        service: Arc::new(service),
        verifier: Arc::new(BearerTokenVerifier::new(config.auth_token.clone())),
    };
    let root = state.service.root().display().to_string();
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, %root, "mediafs listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running media server")?;

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn build_router(state: AppState) -> Router {
    let private = Router::new()
        .route("/videos", get(list_videos))
        .route("/videos/{name}", get(get_video).delete(delete_video))
        .route("/videos/{name}/{*file}", get(stream_asset_file))
        .route("/playlists/{name}/{file}", get(inspect_playlist))
        .route("/cut/{name}", post(cut_clip))
        .route("/frames/{name}/{kind}", get(list_frames))
        .route("/files", get(list_files))
        .route("/files/list", get(list_dir))
        .route(
            "/files/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/files/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(MAX_CHUNK_BYTES)),
        )
        .route("/files/download", get(download_file))
        .route("/files/delete", delete(delete_file))
        .route("/files/rename", put(rename_file))
        .route("/folders/create", post(create_folder))
        .route("/api/media/stream", get(stream_media))
        .route("/api/media/public/share", get(share_media))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_credentials,
        ));

    Router::new()
        .route("/health", get(health))
        .route(PUBLIC_STREAM_ROUTE, get(stream_public))
        .merge(private)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_credentials(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if state.verifier.verify(request.headers()) {
        next.run(request).await
    } else {
        ApiError::unauthorized().into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<MediaSummary>>> {
    Ok(Json(state.service.list_assets().await?))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Json<MediaSummary>> {
    Ok(Json(state.service.describe_asset(&name).await?))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    state.service.delete_asset(&name).await?;
    Ok(Json(json!({ "message": "deleted", "name": name })))
}

async fn stream_asset_file(
    State(state): State<AppState>,
    AxumPath((name, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let mut response = state
        .service
        .stream_asset_file(&name, &file, range_header(&headers))
        .await?;
    apply_cache_policy(&mut response, &file);
    Ok(response)
}

async fn inspect_playlist(
    State(state): State<AppState>,
    AxumPath((name, file)): AxumPath<(String, String)>,
) -> ApiResult<Json<Playlist>> {
    Ok(Json(state.service.inspect_playlist(&name, &file).await?))
}

#[derive(Debug, Deserialize)]
struct CutRequest {
    from: usize,
    to: usize,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CutResponse {
    message: &'static str,
    file: String,
    url: String,
}

async fn cut_clip(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<CutRequest>,
) -> ApiResult<Json<CutResponse>> {
    let outcome = state
        .service
        .cut(&name, request.from, request.to, request.name)
        .await?;
    Ok(Json(CutResponse {
        message: "clip created",
        file: outcome.file,
        url: outcome.url,
    }))
}

async fn list_frames(
    State(state): State<AppState>,
    AxumPath((name, kind)): AxumPath<(String, String)>,
) -> ApiResult<Json<Value>> {
    let kind: FrameKind = kind.parse()?;
    let frames = state.service.list_frames(&name, kind).await?;
    Ok(Json(json!({
        "name": name,
        "kind": kind.to_string(),
        "frames": frames,
    })))
}

async fn list_files(State(state): State<AppState>) -> ApiResult<Json<Vec<FileSummary>>> {
    Ok(Json(state.service.list_files().await?))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

async fn stream_media(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let mut response = state
        .service
        .stream(&query.path, range_header(&headers))
        .await?;
    apply_cache_policy(&mut response, &query.path);
    Ok(response)
}

async fn share_media(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<PublicLink>> {
    Ok(Json(state.service.share(&query.path).await?))
}

async fn stream_public(
    State(state): State<AppState>,
    query: Result<Query<LinkParams>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    // Missing or malformed parameters look exactly like a bad signature.
    let Ok(Query(params)) = query else {
        return Err(MediaError::Unauthorized.into());
    };
    let mut response = state
        .service
        .stream_public(&params, range_header(&headers))
        .await?;
    apply_cache_policy(&mut response, &params.path);
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    path: Option<String>,
}

async fn list_dir(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    let path = query.path.as_deref().unwrap_or(".");
    let entries = state.service.list_dir(path).await.map_err(|err| match err {
        MediaError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "folder not found"),
        other => other.into(),
    })?;
    Ok(Json(entries))
}

/// Streams the multipart field `file` to `path`.
async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let path = required_path(&query.path)?;
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() != Some("file") {
            continue;
        }
        let mut upload = state.service.begin_upload(path).await?;
        while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
            upload.write_chunk(&chunk).await?;
        }
        let size = upload.finish().await?;
        return Ok(Json(json!({ "message": "uploaded", "path": path, "size": size })));
    }
    Err(ApiError::new(StatusCode::BAD_REQUEST, "file required"))
}

#[derive(Debug, Deserialize)]
struct ChunkQuery {
    path: String,
    index: u64,
    #[serde(default)]
    last: Option<String>,
}

/// One chunk of a chunked upload in multipart field `chunk`; `last=1` moves
/// the assembled file into place.
async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let path = required_path(&query.path)?;
    let mut chunk = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() == Some("chunk") {
            chunk = Some(field.bytes().await.map_err(bad_multipart)?);
            break;
        }
    }
    let Some(chunk) = chunk else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "chunk file missing"));
    };

    let received = state.service.append_chunk(path, query.index, &chunk).await?;
    if query.last.as_deref() == Some("1") {
        let size = state.service.finalize_chunk_upload(path).await?;
        return Ok(Json(json!({ "message": "upload complete", "path": path, "size": size })));
    }
    tracing::debug!(path, index = query.index, received, "chunk received");
    Ok(Json(json!({ "message": "chunk received", "index": query.index, "received": received })))
}

async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = required_path(&query.path)?;
    Ok(state.service.download(path, range_header(&headers)).await?)
}

async fn delete_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Value>> {
    let path = required_path(&query.path)?;
    state.service.delete_file(path).await?;
    Ok(Json(json!({ "message": "deleted" })))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    old_path: String,
    new_path: String,
}

async fn rename_file(
    State(state): State<AppState>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<Value>> {
    state
        .service
        .rename(&request.old_path, &request.new_path)
        .await?;
    Ok(Json(json!({ "message": "renamed" })))
}

#[derive(Debug, Deserialize)]
struct CreateFolderRequest {
    path: String,
}

async fn create_folder(
    State(state): State<AppState>,
    Json(request): Json<CreateFolderRequest>,
) -> ApiResult<Json<Value>> {
    state.service.create_folder(&request.path).await?;
    Ok(Json(json!({ "message": "folder created" })))
}

fn required_path(path: &str) -> ApiResult<&str> {
    let path = path.trim();
    if path.is_empty() {
        Err(ApiError::new(StatusCode::BAD_REQUEST, "path query required"))
    } else {
        Ok(path)
    }
}

fn bad_multipart(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), err.body_text())
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
}

/// Playlists must be re-fetched by players; extracted frames never change.
fn apply_cache_policy(response: &mut Response, file: &str) {
    let ext = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let value = match ext.as_str() {
        "m3u8" => HeaderValue::from_static("no-cache"),
        "jpg" | "jpeg" => HeaderValue::from_static(FRAME_CACHE_CONTROL),
        _ => return,
    };
    response.headers_mut().insert(header::CACHE_CONTROL, value);
}
