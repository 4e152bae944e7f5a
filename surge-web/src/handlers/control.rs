//! JSON command surface over the engine handle

use axum::extract::State;
use axum::response::Json;
use surge_core::engine::{CommandResponse, ControlCommand, StartOutcome};
use surge_core::{SessionSnapshot, SurgeError};

use super::ApiError;
use crate::server::AppState;

/// Current session snapshot.
pub async fn api_status(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.engine.status())
}

/// Starts a session. The request body, when present, is the JSON object of
/// setting overrides.
///
/// # Errors
///
/// - `ApiError` - If the engine is no longer running
pub async fn api_start(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<StartOutcome>, ApiError> {
    let overrides = Some(body.trim()).filter(|raw| !raw.is_empty());
    let outcome = state.engine.start(overrides).await?;
    Ok(Json(outcome))
}

/// Aborts the active session, if any.
///
/// # Errors
///
/// - `ApiError` - If the engine is no longer running
pub async fn api_abort(
    State(state): State<AppState>,
) -> Result<Json<CommandResponse>, ApiError> {
    let aborted = state.engine.abort().await?;
    Ok(Json(CommandResponse::Aborted { aborted }))
}

/// Executes a text command (`status`, `abort`, `start [json]`).
///
/// # Errors
///
/// - `ApiError` - If the command cannot be parsed or the engine is gone
pub async fn api_command(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = ControlCommand::parse(&body).map_err(SurgeError::from)?;
    tracing::debug!("Executing control command {:?}", command);
    let response = state.engine.execute(command).await?;
    Ok(Json(response))
}

/// Diagnostic log of the current session as plain text.
pub async fn api_log(State(state): State<AppState>) -> String {
    state.engine.diagnostic_log()
}
