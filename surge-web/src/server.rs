//! Router assembly and server startup.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use surge_core::config::SurgeConfig;
use surge_core::engine::SpeedTestHandle;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    api_abort, api_command, api_log, api_start, api_status, empty, garbage, get_ip,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Handle of the engine driving sessions for API callers
    pub engine: SpeedTestHandle,
}

/// Builds the full router: JSON command API plus the measurement backend.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Command surface
        .route("/api/status", get(api_status))
        .route("/api/start", post(api_start))
        .route("/api/abort", post(api_abort))
        .route("/api/command", post(api_command))
        .route("/api/log", get(api_log))
        // Measurement backend
        .route("/garbage", get(garbage))
        .route("/empty", get(empty).post(empty))
        .route("/getIP", get(get_ip))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `config.web` and serves until the listener fails.
///
/// # Errors
///
/// - `std::io::Error` - If the address cannot be bound or serving fails
pub async fn run_server(config: &SurgeConfig, engine: SpeedTestHandle) -> std::io::Result<()> {
    let app = build_router(AppState { engine });
    let address = config.web.bind_address();

    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("Surge server running on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
