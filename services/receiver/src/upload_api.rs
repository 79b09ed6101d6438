use crate::annotation::AnnotationQueue;
use crate::session_manager::{upload_file_stem, SessionError, SessionManager};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub annotations: Option<AnnotationQueue>,
    /// Annotation endpoint and mode, reported by `/health`
    pub annotation_info: Option<(String, String)>,
    pub max_upload_bytes: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub saved: PathBuf,
    pub session_dir: PathBuf,
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
    let limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (vlm_url, mode) = match &state.annotation_info {
        Some((url, mode)) => (Some(url.clone()), Some(mode.clone())),
        None => (None, None),
    };
    Json(serde_json::json!({
        "status": "ok",
        "role": "capture_receiver",
        "host": camlink::net::local_hostname(),
        "version": env!("CARGO_PKG_VERSION"),
        "root": state.sessions.root(),
        "annotation": state.annotations.is_some(),
        "vlm_url": vlm_url,
        "mode": mode,
    }))
}

#[derive(Debug, Default)]
struct UploadForm {
    image: Option<Bytes>,
    name: Option<String>,
    index: Option<String>,
    session: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let bad_form = |e: axum::extract::multipart::MultipartError| {
        error_response(StatusCode::BAD_REQUEST, "invalid_form", e)
    };

    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => form.image = Some(field.bytes().await.map_err(bad_form)?),
            "name" => form.name = Some(field.text().await.map_err(bad_form)?),
            "index" => form.index = Some(field.text().await.map_err(bad_form)?),
            "session" => form.session = Some(field.text().await.map_err(bad_form)?),
            _ => {}
        }
    }
    Ok(form)
}

/// Store one uploaded image in its session directory.
#[instrument(skip(state, multipart))]
async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let form = read_form(multipart).await?;
    let Some(image) = form.image else {
        return Err(error_response(StatusCode::BAD_REQUEST, "no_file", "no file"));
    };

    let name = form
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "capture".to_string());
    let index = form.index.unwrap_or_else(|| "0".to_string());

    let now = Local::now();
    let session_dir = state
        .sessions
        .resolve_at(&name, form.session.as_deref(), now)
        .map_err(|e| match e {
            SessionError::InvalidSessionHint(_) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_session", e)
            }
            _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "session_failed", e),
        })?;

    let saved = session_dir.join(format!("{}.jpg", upload_file_stem(&name, &index, now)));
    tokio::fs::write(&saved, &image).await.map_err(|e| {
        warn!(path = %saved.display(), error = %e, "Failed to store upload");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_failed", e)
    })?;

    metrics::counter!("camlink_uploads_total").increment(1);
    info!(name = %name, index = %index, bytes = image.len(), path = %saved.display(), "Stored upload");

    if let Some(queue) = &state.annotations {
        queue.try_submit(saved.clone());
    }

    Ok(Json(UploadResponse {
        ok: true,
        saved,
        session_dir,
    }))
}

/// Start the upload API server
pub async fn start_api_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
