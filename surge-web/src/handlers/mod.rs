//! HTTP request handlers organized by functionality

pub mod backend;
pub mod control;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use surge_core::SurgeError;

// Re-export handler functions
pub use backend::{GarbageQuery, MAX_GARBAGE_CHUNKS, empty, garbage, get_ip};
pub use control::{api_abort, api_command, api_log, api_start, api_status};

/// Engine error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub SurgeError);

impl From<SurgeError> for ApiError {
    fn from(error: SurgeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            error if error.is_user_error() => StatusCode::BAD_REQUEST,
            SurgeError::EngineShutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::debug!("API request failed: {}", self.0);
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}
