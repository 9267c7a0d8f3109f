//! HTTP adapter over [`SessionPool`].
//!
//! Routes map one-to-one onto pool operations. Errors become
//! `{"error": message, "kind": kind}` bodies with a status derived from the
//! error kind.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ErrorKind;
use crate::models::task::ExecutionOutput;
use crate::models::worker::SlotSnapshot;
use crate::scheduler::pool::SessionPool;
use crate::{AppError, Result};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Pool every route talks to.
    pub pool: SessionPool,
}

/// Build the router.
#[must_use]
pub fn router(pool: SessionPool, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slots", get(list_slots))
        .route("/sessions", post(create_session))
        .route(
            "/sessions/{id}/files",
            post(upload_file).get(download_file),
        )
        .route("/sessions/{id}/execute", post(execute_code))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(ApiState { pool })
}

/// Bind `addr` and serve until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the address cannot be bound and
/// `AppError::Io` if the server fails.
pub async fn serve(addr: SocketAddr, app: Router, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {addr}: {err}")))?;
    serve_listener(listener, app, cancel).await
}

/// Serve on an already bound listener until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_listener(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;
    info!("HTTP server shut down");
    Ok(())
}

/// Response body for `POST /sessions`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// New session id.
    pub session_id: String,
}

/// Response body for uploads.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStored {
    /// Stored filename.
    pub filename: String,
}

/// Request body for `POST /sessions/{id}/execute`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Snippet to evaluate.
    pub code: String,
    /// Deadline override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Query for downloads.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    /// Path relative to the session workspace.
    pub path: String,
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable kind.
    pub kind: ErrorKind,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// [`AppError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            info!(%status, error = %self.0, "request failed");
        } else {
            debug!(%status, error = %self.0, "request rejected");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(err: &AppError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::PathTraversal => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::WorkerCrash => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn list_slots(State(state): State<ApiState>) -> ApiResult<Json<Vec<SlotSnapshot>>> {
    Ok(Json(state.pool.snapshot().await?))
}

async fn create_session(State(state): State<ApiState>) -> ApiResult<Json<SessionCreated>> {
    let session_id = state.pool.create_session().await?;
    Ok(Json(SessionCreated { session_id }))
}

async fn upload_file(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<FileStored>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("malformed multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| AppError::Validation("file field has no filename".into()))?;
        let content = field
            .bytes()
            .await
            .map_err(|err| AppError::Validation(format!("unreadable upload: {err}")))?;
        let filename = state
            .pool
            .upload_file(&id, &filename, content.to_vec())
            .await?;
        return Ok(Json(FileStored { filename }));
    }
    Err(AppError::Validation("multipart field `file` is required".into()).into())
}

async fn execute_code(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecutionOutput>> {
    let timeout = request.timeout_ms.map(Duration::from_millis);
    let output = state.pool.execute_code(&id, &request.code, timeout).await?;
    Ok(Json(output))
}

async fn download_file(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let content = state.pool.download_file(&id, &query.path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}
