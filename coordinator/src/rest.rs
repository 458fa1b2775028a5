use crate::errors::Error;
use crate::firmware::FirmwareStore;
use crate::model::{ResetCommand, ResetStatus, UpdateCheck, UploadReceipt, VoteOutcome};
use crate::monitor;
use crate::ota::{self, RawStatusReport};
use crate::voting;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::error;
use uuid::Uuid;

/// How often a progress stream rechecks the status projection.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MAX_FIRMWARE_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    store: FirmwareStore,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    device_id: String,
    // Identity is established upstream; the gateway injects the caller's
    // user id into the body it forwards.
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct CheckResetQuery {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct OtaCheckRequest {
    device_id: String,
    current_firmware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    device_id: String,
    filename: String,
}

pub fn create_router(pool: PgPool, store: FirmwareStore) -> Router {
    let state = AppState { pool, store };

    Router::new()
        .route("/api/v1/reset/vote", post(cast_vote))
        .route("/api/v1/reset/status", post(reset_status))
        .route("/api/v1/reset/check", get(check_reset))
        .route("/api/v1/ota/check", post(ota_check))
        .route("/api/v1/ota/status", post(ota_status))
        .route("/api/v1/ota/progress/:device_id", get(ota_progress))
        .route(
            "/api/v1/firmware/upload",
            post(upload_firmware).layer(DefaultBodyLimit::max(MAX_FIRMWARE_BYTES)),
        )
        .route("/api/v1/firmware/file/:token", get(download_signed))
        .route(
            "/api/v1/firmware/public/:device_id/:filename",
            get(download_public),
        )
        .with_state(state)
}

async fn cast_vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteOutcome>, ApiError> {
    if req.device_id.is_empty() {
        return Err(Error::Validation("device_id is required".to_string()).into());
    }
    if req.user_id.is_empty() {
        return Err(Error::Validation("user_id is required".to_string()).into());
    }

    let outcome = voting::cast_vote(&state.pool, &req.device_id, &req.user_id).await?;
    Ok(Json(outcome))
}

async fn reset_status(
    State(state): State<AppState>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<ResetStatus>, ApiError> {
    if req.device_id.is_empty() {
        return Err(Error::Validation("device_id is required".to_string()).into());
    }

    let status = voting::reset_status(&state.pool, &req.device_id).await?;
    Ok(Json(status))
}

// Device-facing: the meter polls this without user credentials.
async fn check_reset(
    State(state): State<AppState>,
    Query(query): Query<CheckResetQuery>,
) -> Result<Json<ResetCommand>, ApiError> {
    let command = voting::check_and_consume(&state.pool, &query.device_id).await?;
    Ok(Json(command))
}

async fn ota_check(
    State(state): State<AppState>,
    Json(req): Json<OtaCheckRequest>,
) -> Result<Json<UpdateCheck>, ApiError> {
    if req.device_id.is_empty() {
        return Err(Error::Validation("device_id is required".to_string()).into());
    }

    let check = state
        .store
        .check_for_update(&req.device_id, req.current_firmware_version.as_deref())
        .await?;
    Ok(Json(check))
}

async fn ota_status(
    State(state): State<AppState>,
    Json(report): Json<RawStatusReport>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ota::report_status(&state.pool, report).await?;
    Ok(Json(json!({
        "success": true,
        "message": "OTA status recorded"
    })))
}

/// Streams monitor events for one device as server-sent events. Each
/// connection gets its own watch task; disconnecting tears it down.
async fn ota_progress(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (_handle, events) =
        monitor::spawn_monitor(state.pool.clone(), device_id, STATUS_POLL_INTERVAL).await?;

    let stream = ReceiverStream::new(events).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn upload_firmware(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<UploadReceipt>, ApiError> {
    let receipt = state
        .store
        .upload(&query.device_id, &query.filename, &body)
        .await?;
    Ok(Json(receipt))
}

async fn download_signed(
    State(state): State<AppState>,
    Path(token): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (filename, bytes) = state.store.read_signed(token).await?;
    Ok(firmware_response(&filename, bytes))
}

async fn download_public(
    State(state): State<AppState>,
    Path((device_id, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (filename, bytes) = state.store.read_public(&device_id, &filename).await?;
    Ok(firmware_response(&filename, bytes))
}

fn firmware_response(filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::AlreadyVoted => StatusCode::CONFLICT,
            Error::DeviceNotFound(_) | Error::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
