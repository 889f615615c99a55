use crate::change_feed::FeedHealth;
use crate::config::ApiConfig;
use crate::model::{SourceFile, TargetDescriptor, ValidationError};
use crate::network::{NetworkConditions, NetworkMonitor};
use crate::reconciler::ReconciledEntry;
use crate::scheduler::{QueueStats, TaskActionError, UploadQueueScheduler, UploadTask};
use crate::session::SessionRegistry;
use crate::storage_client::RecordStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: UploadQueueScheduler,
    pub sessions: Arc<SessionRegistry>,
    pub records: Arc<dyn RecordStore>,
    pub network: NetworkMonitor,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn validation_error(e: ValidationError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
}

fn task_action_error(e: TaskActionError) -> ApiError {
    match e {
        TaskActionError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
        TaskActionError::InvalidState { .. } => {
            api_error(StatusCode::CONFLICT, "INVALID_STATE", e.to_string())
        }
    }
}

/// File in an upload request
#[derive(Debug, Deserialize)]
pub struct UploadFile {
    pub filename: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Base64-encoded content
    pub data: String,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// Upload batch request
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub target: TargetDescriptor,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub task_ids: Vec<Uuid>,
}

/// Reconciled entry with its retrieval URL
#[derive(Debug, Serialize)]
pub struct FileEntry {
    #[serde(flatten)]
    pub entry: ReconciledEntry,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct BusinessFilesResponse {
    pub business_id: Uuid,
    pub feed_health: FeedHealth,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
pub struct NetworkResponse {
    pub conditions: NetworkConditions,
    pub concurrency_limit: usize,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/uploads", post(create_uploads).get(list_uploads))
        .route("/api/v1/uploads/stats", get(upload_stats))
        .route("/api/v1/uploads/cancel-all", post(cancel_all_uploads))
        .route("/api/v1/uploads/completed", delete(clear_completed_uploads))
        .route("/api/v1/uploads/:task_id", get(get_upload))
        .route("/api/v1/uploads/:task_id/cancel", post(cancel_upload))
        .route("/api/v1/uploads/:task_id/retry", post(retry_upload))
        .route("/api/v1/businesses/:business_id/files", get(business_files))
        .route("/api/v1/network", put(report_network))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photo-sync"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn decode_files(files: Vec<UploadFile>) -> Result<Vec<SourceFile>, ApiError> {
    files
        .into_iter()
        .map(|file| {
            let bytes = STANDARD.decode(file.data.as_bytes()).map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "INVALID_BASE64",
                    format!("{}: {e}", file.filename),
                )
            })?;
            Ok(SourceFile::new(file.filename, file.mime_type, bytes))
        })
        .collect()
}

/// Enqueue a batch of files for one target
#[instrument(skip_all)]
async fn create_uploads(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    debug!(file_count = request.files.len(), "Upload batch received");
    let files = decode_files(request.files)?;
    let task_ids = state
        .scheduler
        .enqueue(files, &request.target)
        .map_err(validation_error)?;
    Ok((StatusCode::ACCEPTED, Json(UploadResponse { task_ids })))
}

async fn list_uploads(State(state): State<AppState>) -> Json<Vec<UploadTask>> {
    Json(state.scheduler.tasks())
}

async fn upload_stats(State(state): State<AppState>) -> Json<QueueStats> {
    let stats = state.scheduler.stats().borrow().clone();
    Json(stats)
}

async fn get_upload(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<UploadTask>, ApiError> {
    state
        .scheduler
        .task(task_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Upload task not found"))
}

/// Run a task action, then return the task's current state
fn task_action(
    state: &AppState,
    task_id: Uuid,
    action: impl FnOnce(&UploadQueueScheduler, Uuid) -> Result<(), TaskActionError>,
) -> Result<Json<UploadTask>, ApiError> {
    action(&state.scheduler, task_id).map_err(task_action_error)?;
    state
        .scheduler
        .task(task_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Upload task not found"))
}

#[instrument(skip(state))]
async fn cancel_upload(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<UploadTask>, ApiError> {
    task_action(&state, task_id, UploadQueueScheduler::cancel)
}

#[instrument(skip(state))]
async fn retry_upload(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<UploadTask>, ApiError> {
    task_action(&state, task_id, UploadQueueScheduler::retry)
}

async fn cancel_all_uploads(State(state): State<AppState>) -> impl IntoResponse {
    let cancelled = state.scheduler.cancel_all();
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn clear_completed_uploads(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.scheduler.clear_completed();
    Json(serde_json::json!({ "removed": removed }))
}

/// Reconciled file list of a business; starts its sync session on first use
#[instrument(skip(state))]
async fn business_files(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> Json<BusinessFilesResponse> {
    let session = state.sessions.session(business_id);
    let feed_health = *session.feed_health().borrow();

    let files = session
        .view()
        .entries
        .into_iter()
        .map(|entry| FileEntry {
            url: state.scheduler.public_url(&entry.record.storage_path),
            entry,
        })
        .collect();

    Json(BusinessFilesResponse {
        business_id,
        feed_health,
        files,
    })
}

async fn report_network(
    State(state): State<AppState>,
    Json(conditions): Json<NetworkConditions>,
) -> Json<NetworkResponse> {
    state.network.report(conditions);
    Json(NetworkResponse {
        conditions: state.network.current(),
        concurrency_limit: state.scheduler.concurrency_limit(),
    })
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting photo sync API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!(error = %e, "API server error");
            e
        })
        .context("API server error")?;

    Ok(())
}
