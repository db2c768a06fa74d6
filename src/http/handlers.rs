use super::state::AppState;
use crate::service::{ServiceError, DEFAULT_DURATION_SECS};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRecordingRequest {
    /// Capture length in seconds, clamped to the supported range
    /// (default: 60)
    pub duration_seconds: Option<i64>,

    /// Copy the transcription to the clipboard when done
    #[serde(default)]
    pub copy_to_clipboard: bool,

    /// Report the transcription without typing it
    #[serde(default)]
    pub preview_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct StartRecordingResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub session_id: String,
    pub accepted: bool,
}

#[derive(Debug, Deserialize)]
pub struct TypeTextRequest {
    pub text: String,

    #[serde(default)]
    pub copy_to_clipboard: bool,
}

#[derive(Debug, Serialize)]
pub struct TypeTextResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DependenciesResponse {
    pub ok: bool,
    pub missing: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Start a new recording session. All fields are optional; an empty
/// JSON object records with the defaults.
pub async fn start_recording(
    State(state): State<AppState>,
    Json(req): Json<StartRecordingRequest>,
) -> impl IntoResponse {
    let duration = req.duration_seconds.unwrap_or(DEFAULT_DURATION_SECS);

    match state
        .service
        .start_recording(duration, req.copy_to_clipboard, req.preview_mode)
        .await
    {
        Ok(session_id) => {
            info!("Started session {} over HTTP", session_id);
            (
                StatusCode::CREATED,
                Json(StartRecordingResponse {
                    session_id,
                    status: "starting".to_string(),
                }),
            )
                .into_response()
        }
        Err(err @ ServiceError::MissingDependencies(_)) => {
            error!("Refusing to record: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// GET /sessions
/// List all live sessions, oldest first
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.service.list_sessions().await;
    (StatusCode::OK, Json(sessions))
}

/// GET /sessions/:session_id
/// Get the current snapshot of one session
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.service.get_session(&session_id).await {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => session_not_found(&session_id),
    }
}

/// POST /sessions/:session_id/stop
/// Ask a session to stop capturing; transcription still follows
pub async fn stop_recording(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if state.service.stop_recording(&session_id).await {
        (
            StatusCode::OK,
            Json(AcceptedResponse {
                session_id,
                accepted: true,
            }),
        )
            .into_response()
    } else {
        session_not_found(&session_id)
    }
}

/// POST /sessions/:session_id/cancel
/// Cancel a session outright; nothing is transcribed
pub async fn cancel_recording(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if state.service.cancel_recording(&session_id).await {
        (
            StatusCode::OK,
            Json(AcceptedResponse {
                session_id,
                accepted: true,
            }),
        )
            .into_response()
    } else {
        session_not_found(&session_id)
    }
}

/// POST /type
/// Type caller-provided text into the focused window
pub async fn type_text(
    State(state): State<AppState>,
    Json(req): Json<TypeTextRequest>,
) -> impl IntoResponse {
    let success = state
        .service
        .type_text(&req.text, req.copy_to_clipboard)
        .await;
    (StatusCode::OK, Json(TypeTextResponse { success }))
}

/// GET /status
/// The one-line service status string
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.service.service_status().await;
    (StatusCode::OK, Json(StatusResponse { status }))
}

/// GET /dependencies
/// Check external tools and backend reachability
pub async fn check_dependencies(State(state): State<AppState>) -> impl IntoResponse {
    let (ok, missing) = state.service.check_dependencies().await;
    (StatusCode::OK, Json(DependenciesResponse { ok, missing }))
}

/// GET /health
/// Liveness check for the service itself, not the whisper backend
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            active_sessions: state.service.active_count().await,
        }),
    )
}

fn session_not_found(session_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Session {} not found", session_id),
        }),
    )
        .into_response()
}
