use crate::sink::TransmitError;
use crate::worker::{CaptureError, CaptureWorker};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use camlink::trigger::{CaptureRequest, CaptureResponse};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<CaptureWorker>,
    pub host: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/capture", post(capture))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.worker.stats();
    Json(serde_json::json!({
        "status": "ok",
        "role": "raspi_cam",
        "host": state.host,
        "version": env!("CARGO_PKG_VERSION"),
        "camera_open": stats.device_open,
        "requests": stats.requests,
        "frames_sent": stats.frames_sent,
    }))
}

/// Capture and deliver frames; responds once the last frame is sent.
#[instrument(skip(state, body))]
async fn capture(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CaptureResponse>, ApiError> {
    let request: CaptureRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CaptureRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, "invalid_json", e))?
    };

    match state.worker.capture(&request).await {
        Ok(outcome) => Ok(Json(CaptureResponse {
            ok: true,
            sent: outcome.sent,
        })),
        Err(CaptureError::InvalidRequest(message)) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            message,
        )),
        Err(e @ CaptureError::Transmit(TransmitError::NoReceiver)) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_receiver",
            e,
        )),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "capture_failed",
            e,
        )),
    }
}

/// Start the capture API server
pub async fn start_api_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!(address = %addr, "Starting capture API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
