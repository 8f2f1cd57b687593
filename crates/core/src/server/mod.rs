use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::generate::{GenerationError, Generator};
use crate::pipeline::{Pipeline, ScriptPipeline};
use crate::storage::{GcsStore, ObjectStore};

const MISSING_URL_MESSAGE: &str = "JSON payload with 'input_image_url' is required.";
const MISCONFIGURED_MESSAGE: &str = "Service is misconfigured.";
const INTERNAL_ERROR_MESSAGE: &str = "An internal server error occurred.";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    generator: Generator,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: Arc<dyn Pipeline>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let generator = Generator::new(&config, pipeline, store)?;
        Ok(Self {
            inner: Arc::new(AppStateInner { config, generator }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn generator(&self) -> &Generator {
        &self.inner.generator
    }
}

/// Production wiring: the workflow script as a child process and GCS for output.
pub async fn app_state_from_config(config: AppConfig) -> Result<AppState> {
    let pipeline = Arc::new(ScriptPipeline::from_config(&config.pipeline));
    let store = Arc::new(GcsStore::from_environment(config.storage.public_base_url.clone()).await?);
    AppState::new(config, pipeline, store)
}

// ─── Request / Response types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub input_image_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub output_video_url: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health).post(generate_video))
        .route("/api/health", get(health))
        .route("/api/generate", post(generate_video))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn generate_video(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("generate", request_id = %request_id);
    handle_generate(state, payload).instrument(span).await
}

async fn handle_generate(
    state: AppState,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, AppError> {
    let Some(bucket) = state.config().output_bucket() else {
        error!("OUTPUT_BUCKET is not set; refusing generation request");
        return Err(AppError::Internal(MISCONFIGURED_MESSAGE.to_string()));
    };

    let Json(request) = payload.map_err(|rejection| {
        warn!(reason = %rejection.body_text(), "Rejected generation request body");
        AppError::BadRequest(MISSING_URL_MESSAGE.to_string())
    })?;

    info!(bucket, "Generation requested");

    let stored = state
        .generator()
        .generate(&request.input_image_url, bucket)
        .await?;

    Ok(Json(GenerateResponse {
        output_video_url: stored.public_url,
    }))
}

// ─── Error handling ──────────────────────────────────────────────────────────

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Fetch(_) => {
                error!(error = %err, "Input download failed");
                AppError::BadRequest(err.to_string())
            }
            GenerationError::NoOutput {
                ref dir,
                ref pattern,
            } => {
                error!(dir = %dir.display(), pattern = %pattern, "Generation failed. No output file found.");
                AppError::Internal(err.to_string())
            }
            GenerationError::Pipeline(_)
            | GenerationError::Storage(_)
            | GenerationError::Internal(_) => {
                error!(error = %err, "Generation request failed");
                AppError::Internal(INTERNAL_ERROR_MESSAGE.to_string())
            }
        }
    }
}
