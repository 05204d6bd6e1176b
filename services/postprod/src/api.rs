use crate::batch_runner::{BatchResponse, BatchRunner};
use crate::config::ApiConfig;
use crate::error::BatchError;
use crate::event::EventBatch;
use crate::record::PipelineKind;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<BatchRunner>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(error: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error,
            code: "UNKNOWN_PIPELINE".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/batches/:kind", post(run_batch))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "postprod-service"
    }))
}

/// Run one storage-event batch synchronously and return its report
#[instrument(skip(state, batch), fields(records = batch.len()))]
async fn run_batch(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<BatchResponse>, ApiError> {
    let kind: PipelineKind = kind.parse().map_err(|e: String| {
        warn!(error = %e, "Rejected batch for unknown pipeline");
        not_found(e)
    })?;

    state
        .runner
        .run(kind, &batch)
        .await
        .map(Json)
        .map_err(|e: BatchError| not_found(e.to_string()))
}

/// Start the HTTP server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting batch API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
