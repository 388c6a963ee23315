use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::functions::pipeline::{MediaKind, Pipeline, View, Workspace};
use crate::schema::{GenerationConfig, GenerationJob};
use crate::services::CredentialSignal;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub credentials: Arc<CredentialSignal>,
    pub export_dir: Arc<PathBuf>,
}

/// HTTP-facing error; every variant renders as `{ "error": ..., "code": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Pipeline(err) = &self;
        let (status, code, message) = match err {
            PipelineError::InvalidConfig(e) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            PipelineError::JobNotFound(_) | PipelineError::MediaUnavailable { .. } => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
            }
            PipelineError::VideoInProgress(_) | PipelineError::ImageInProgress(_) => {
                (StatusCode::CONFLICT, "CONFLICT", err.to_string())
            }
            PipelineError::Expansion(remote) if remote.needs_credential() => (
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_REQUIRED",
                err.to_string(),
            ),
            PipelineError::Expansion(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", err.to_string()),
            PipelineError::Persistence(_) | PipelineError::Io(_) => {
                tracing::error!(error = %err, "api: internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceView {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub credential_required: bool,
    pub credential_requests: u64,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub prompt: String,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnimateRequest {
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
pub struct FocusRequest {
    pub view: View,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub dir: String,
    pub files: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/workspace", get(workspace))
        .route("/api/runs", post(start_run))
        .route("/api/jobs/{id}/animate", post(animate))
        .route("/api/jobs/{id}/image", get(download_image))
        .route("/api/jobs/{id}/video", get(download_video))
        .route("/api/focus", put(set_focus))
        .route("/api/export", post(export))
        .route("/api/history", delete(clear_history))
        .route("/api/history/{id}", delete(delete_history_item))
        .route("/api/credential/acknowledge", post(acknowledge_credential))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn workspace(State(state): State<AppState>) -> Json<WorkspaceView> {
    Json(WorkspaceView {
        workspace: state.pipeline.snapshot(),
        credential_required: state.credentials.is_required(),
        credential_requests: state.credentials.request_count(),
    })
}

async fn start_run(
    State(state): State<AppState>,
    Json(input): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<DataResponse<Vec<GenerationJob>>>)> {
    let jobs = state.pipeline.start_run(&input.prompt, input.config).await?;
    let status = if jobs.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(DataResponse { data: jobs })))
}

async fn animate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<AnimateRequest>,
) -> ApiResult<(StatusCode, Json<DataResponse<GenerationJob>>)> {
    let job = state.pipeline.animate_existing(&id, input.config).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}

fn media_response(state: &AppState, id: &str, kind: MediaKind) -> ApiResult<Response> {
    let file = state.pipeline.download(id, kind)?;
    let disposition = format!("attachment; filename=\"{}\"", file.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.bytes,
    )
        .into_response())
}

async fn download_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    media_response(&state, &id, MediaKind::Image)
}

async fn download_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    media_response(&state, &id, MediaKind::Video)
}

async fn set_focus(State(state): State<AppState>, Json(input): Json<FocusRequest>) -> StatusCode {
    state.pipeline.set_focus(input.view);
    StatusCode::NO_CONTENT
}

async fn export(State(state): State<AppState>) -> ApiResult<Json<DataResponse<ExportResponse>>> {
    let written = state.pipeline.export_visible(&state.export_dir).await?;
    let files = written
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    Ok(Json(DataResponse {
        data: ExportResponse {
            dir: state.export_dir.display().to_string(),
            files,
        },
    }))
}

async fn delete_history_item(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.pipeline.delete_history_item(&id).await;
    StatusCode::NO_CONTENT
}

async fn clear_history(State(state): State<AppState>) -> StatusCode {
    state.pipeline.clear_history().await;
    StatusCode::NO_CONTENT
}

async fn acknowledge_credential(State(state): State<AppState>) -> StatusCode {
    state.credentials.acknowledge();
    StatusCode::NO_CONTENT
}
