//! Thin HTTP surface over the orchestrator and result store.
//!
//! The handlers only validate, hand off, and read back — all analysis
//! behavior lives below. Every route except `/api/health` requires the
//! configured `X-API-Key` header.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ErrorKind, SandboxError};
use crate::model::{Report, Sample, TaskStatus};
use crate::orchestrator::Orchestrator;
use crate::store::ResultStore;
use crate::vm::VmPool;

/// Timeout bounds accepted from clients (seconds).
const MIN_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<ResultStore>,
    pub pool: Arc<VmPool>,
    pub settings: Arc<Settings>,
}

pub fn router(state: AppState) -> Router {
    let max_body = state.settings.server.max_file_size as usize + 64 * 1024;

    let protected = Router::new()
        .route("/api/analyze", post(submit_analysis))
        .route("/api/task/:task_id", get(get_task).delete(cancel_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/result/:task_id", get(get_result))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorKind,
    detail: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error,
                detail: detail.into(),
            },
        }
    }

    fn not_found(task_id: Uuid) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorKind::Internal,
            format!("no such task: {task_id}"),
        )
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        let status = match e.kind {
            ErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidSample | ErrorKind::VmUnknown => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.kind, e.detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if provided != Some(state.settings.server.api_key.as_str()) {
        warn!("request rejected: missing or invalid API key");
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::Internal,
            "missing or invalid X-API-Key header",
        )
        .into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    task_id: Uuid,
    status: TaskStatus,
}

async fn submit_analysis(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut file_data: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut override_name: Option<String> = None;
    let mut vm_names: Option<Vec<String>> = None;
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidSample,
            format!("invalid multipart body: {e}"),
        )
    })? {
        match field.name().unwrap_or_default() {
            "file" => {
                original_name = field.file_name().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        ErrorKind::InvalidSample,
                        format!("failed to read upload: {e}"),
                    )
                })?;
                file_data = Some(bytes.to_vec());
            }
            "filename" => {
                override_name = Some(read_text_field(field).await?);
            }
            "vm_names" => {
                let raw = read_text_field(field).await?;
                let names: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !names.is_empty() {
                    vm_names = Some(names);
                }
            }
            "timeout" => {
                let raw = read_text_field(field).await?;
                let parsed: u64 = raw.trim().parse().map_err(|_| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        ErrorKind::InvalidSample,
                        format!("timeout is not a number: {raw}"),
                    )
                })?;
                timeout_secs = parsed.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
            }
            other => {
                warn!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let data = file_data.ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidSample,
            "no `file` field in upload",
        )
    })?;
    if data.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidSample,
            "uploaded file is empty",
        ));
    }
    if data.len() as u64 > state.settings.server.max_file_size {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::InvalidSample,
            format!(
                "file exceeds max_file_size of {} bytes",
                state.settings.server.max_file_size
            ),
        ));
    }

    let name = sanitize_file_name(
        override_name
            .or(original_name)
            .unwrap_or_else(|| "sample".to_string()),
    );
    let sample = persist_sample(&state.settings.server.upload_dir, &name, &data).await?;

    info!(
        sample = %sample.name,
        hash = %sample.hash_hex,
        size = sample.size_bytes,
        "sample received"
    );

    let task_id = state
        .orchestrator
        .submit(sample, vm_names, timeout_secs)?;

    Ok(Json(SubmitResponse {
        task_id,
        status: TaskStatus::Pending,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<crate::model::Task>, ApiError> {
    state
        .store
        .get(task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(task_id))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<crate::model::Task>> {
    Json(state.store.list(query.status, query.limit.unwrap_or(50)))
}

async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Report>, ApiError> {
    let task = state
        .store
        .get(task_id)
        .ok_or_else(|| ApiError::not_found(task_id))?;
    if !task.status.is_terminal() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorKind::Internal,
            format!("task is still {:?}", task.status),
        ));
    }
    Ok(Json(Report::from_task(&task)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.get(task_id).is_none() {
        return Err(ApiError::not_found(task_id));
    }
    if state.orchestrator.cancel(task_id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorKind::Internal,
            "task is already terminal",
        ))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pool: crate::vm::PoolSnapshot,
    queue: crate::orchestrator::QueueSnapshot,
    tasks: crate::store::StoreCounts,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pool: state.pool.snapshot(),
        queue: state.orchestrator.queue_snapshot(),
        tasks: state.store.counts(),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field.text().await.map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidSample,
            format!("failed to read field: {e}"),
        )
    })
}

/// Keep only the base name: uploads must not steer where the sample lands.
pub fn sanitize_file_name(name: String) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("sample")
        .trim()
        .to_string();
    if base.is_empty() || base == "." || base == ".." {
        "sample".to_string()
    } else {
        base
    }
}

/// Write the sample to the upload directory and build its immutable record.
/// The on-disk name is prefixed with the sample id so identical uploads
/// never alias.
async fn persist_sample(
    upload_dir: &std::path::Path,
    name: &str,
    data: &[u8],
) -> Result<Sample, ApiError> {
    let sample_id = Uuid::new_v4();
    tokio::fs::create_dir_all(upload_dir).await.map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            format!("failed to create upload dir: {e}"),
        )
    })?;

    let path = upload_dir.join(format!("{sample_id}_{name}"));
    tokio::fs::write(&path, data).await.map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            format!("failed to persist sample: {e}"),
        )
    })?;

    let mut hasher = Sha256::new();
    hasher.update(data);
    let hash_hex = format!("{:x}", hasher.finalize());

    Ok(Sample {
        sample_id,
        name: name.to_string(),
        path,
        hash_hex,
        size_bytes: data.len() as u64,
        received_at: Local::now(),
    })
}
