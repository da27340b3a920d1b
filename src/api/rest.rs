//! Axum REST API handlers

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::engine::ModelRegistry;
use crate::service::{HealthReporter, InferenceSession, UploadedAudio};

use super::auth::{require_bearer, AuthGate};
use super::dto::*;
use super::upload::{UploadGuard, UploadRejection};

/// Room for multipart framing on top of the file itself
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

const UPLOAD_FIELD: &str = "file";

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub health: HealthReporter,
    pub guard: UploadGuard,
    pub auth: Arc<dyn AuthGate>,
    pub scratch_dir: PathBuf,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    let max_file_size = usize::try_from(state.guard.max_size()).unwrap_or(usize::MAX);
    let body_limit = max_file_size.saturating_add(MULTIPART_OVERHEAD);

    // Auth runs before the handler touches the body
    let protected = Router::new()
        .route("/diarize", post(diarize_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health_handler))
        .route("/system", get(system_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// System Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.health.health().await.into())
}

async fn system_handler(State(state): State<Arc<AppState>>) -> Json<SystemResponse> {
    let diagnostics = state.health.diagnostics().await;

    Json(SystemResponse {
        diagnostics,
        upload: UploadLimitsDto {
            max_file_size_mb: state.guard.max_size_mb(),
            allowed_extensions: state.guard.allowed_extensions().map(str::to_string).collect(),
        },
    })
}

// ============================================================================
// Diarization Handler
// ============================================================================

async fn diarize_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DiarizeResponse>, ApiError> {
    // A body that is not multipart carries no file
    let multipart = multipart.map_err(|e| {
        warn!("Rejected upload: {}", e);
        rejected(UploadRejection::MissingFile)
    })?;

    let audio = read_upload(&state.guard, multipart).await?;

    // Detached so a client hang-up cannot cancel a load or strand a scratch file;
    // the session logs its own failures under the request span
    let session = InferenceSession::new(state.registry.clone(), state.scratch_dir.clone());
    let result = session.run_detached(audio).await.map_err(|failure| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::failure(&failure.error.to_string())),
        )
    })?;

    Ok(Json(result.into()))
}

/// Pull the `file` field out of the form, enforcing the guard while streaming
async fn read_upload(guard: &UploadGuard, mut multipart: Multipart) -> Result<UploadedAudio, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(|e| multipart_error(guard, e))? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        // Plain form values are not files
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        let extension = guard.check_filename(&filename).map_err(rejected)?;

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(guard, e))? {
            guard
                .check_size((data.len() + chunk.len()) as u64)
                .map_err(rejected)?;
            data.extend_from_slice(&chunk);
        }

        return Ok(UploadedAudio {
            filename,
            extension,
            data: Bytes::from(data),
        });
    }

    Err(rejected(UploadRejection::MissingFile))
}

fn rejected(rejection: UploadRejection) -> ApiError {
    warn!("Rejected upload: {}", rejection);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&rejection.to_string())))
}

fn multipart_error(guard: &UploadGuard, e: MultipartError) -> ApiError {
    // Tripping the body limit means the file was over the ceiling
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return rejected(guard.too_large());
    }
    warn!("Malformed multipart body: {}", e);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.body_text())))
}
