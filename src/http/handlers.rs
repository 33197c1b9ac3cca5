use std::sync::Arc;

use super::state::{AppState, SessionSlot};
use crate::error::VoiceError;
use crate::session::{SessionStats, SessionStatus, KNOWN_CHARACTERS};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartVoiceRequest {
    /// Character selector (default: configured character)
    pub character: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartVoiceResponse {
    pub session_id: String,
    pub character: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StopVoiceResponse {
    pub session_id: String,
    pub status: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct CharactersResponse {
    pub characters: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn start_failure_status(error: &VoiceError) -> StatusCode {
    match error {
        VoiceError::SessionCreate(_) | VoiceError::Channel { .. } => StatusCode::BAD_GATEWAY,
        VoiceError::DeviceTimeout(_) | VoiceError::DeviceUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /voice/start
/// Start a voice session (only one may run at a time)
pub async fn start_voice(
    State(state): State<AppState>,
    body: Option<Json<StartVoiceRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let character = req
        .character
        .unwrap_or_else(|| state.config.session.character.clone());

    {
        let mut slot = state.active.lock().await;
        let ended = match &*slot {
            SessionSlot::Starting { character } => {
                return error_response(
                    StatusCode::CONFLICT,
                    format!("A session with {} is already starting", character),
                );
            }
            SessionSlot::Running(session) if session.is_active() => {
                return error_response(
                    StatusCode::CONFLICT,
                    format!("Session {} is already active", session.session_id()),
                );
            }
            SessionSlot::Running(_) => true,
            SessionSlot::Idle => false,
        };

        // ended on its own (terminal failure); reap it before starting anew
        if ended {
            if let Some(mut session) = slot.take_running() {
                let stats = session.stop().await;
                info!(
                    "Reaped ended session {} ({:?})",
                    stats.session_id, stats.terminal_error
                );
            }
        }
        *slot = SessionSlot::Starting {
            character: character.clone(),
        };
    }

    info!("Starting voice session with {}", character);

    // Runs to completion even if the client goes away, so the slot never
    // stays in `Starting`
    let launcher = Arc::clone(&state.launcher);
    let config = Arc::clone(&state.config);
    let slot = Arc::clone(&state.active);
    let launched = tokio::spawn(async move {
        let result = launcher.launch(&config, &character).await;
        let mut slot = slot.lock().await;
        match result {
            Ok(session) => {
                let response = StartVoiceResponse {
                    session_id: session.session_id().to_string(),
                    character: session.info().character.clone(),
                    status: "active".to_string(),
                };
                *slot = SessionSlot::Running(session);
                Ok(response)
            }
            Err(e) => {
                *slot = SessionSlot::Idle;
                Err(e)
            }
        }
    })
    .await;

    match launched {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(e)) => {
            error!("Failed to start voice session: {}", e);
            error_response(
                start_failure_status(&e),
                format!("Failed to start voice session: {}", e),
            )
        }
        Err(e) => {
            error!("Voice session launch task failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start voice session: {}", e),
            )
        }
    }
}

/// POST /voice/stop
/// Stop the active voice session
pub async fn stop_voice(State(state): State<AppState>) -> impl IntoResponse {
    let session = {
        let mut slot = state.active.lock().await;
        if let SessionSlot::Starting { .. } = &*slot {
            return error_response(
                StatusCode::CONFLICT,
                "Voice session is still starting".to_string(),
            );
        }
        slot.take_running()
    };

    match session {
        Some(mut session) => {
            let stats = session.stop().await;
            info!("Voice session {} stopped", stats.session_id);
            (
                StatusCode::OK,
                Json(StopVoiceResponse {
                    session_id: stats.session_id.clone(),
                    status: "stopped".to_string(),
                    stats,
                }),
            )
                .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "No active voice session".to_string()),
    }
}

/// GET /voice/status
/// Status snapshot of the current session
pub async fn voice_status(State(state): State<AppState>) -> impl IntoResponse {
    let slot = state.active.lock().await;

    match &*slot {
        SessionSlot::Running(session) => {
            let status: SessionStatus = session.status().borrow().clone();
            (StatusCode::OK, Json(status)).into_response()
        }
        SessionSlot::Starting { character } => {
            (StatusCode::OK, Json(SessionStatus::new("", character))).into_response()
        }
        SessionSlot::Idle => {
            error_response(StatusCode::NOT_FOUND, "No active voice session".to_string())
        }
    }
}

/// GET /characters
/// Characters offered by the service (falls back to the known list)
pub async fn list_characters(State(state): State<AppState>) -> impl IntoResponse {
    let characters = match state.launcher.characters().await {
        Ok(characters) => characters,
        Err(e) => {
            warn!("Character list unavailable, using defaults: {}", e);
            KNOWN_CHARACTERS.iter().map(|c| c.to_string()).collect()
        }
    };
    (StatusCode::OK, Json(CharactersResponse { characters }))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
