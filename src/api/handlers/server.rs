//! Xray lifecycle endpoints: status, restart, stop and the assembled config.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::ServerStatusResponse;
use crate::app_state::AppState;
use crate::error::{ErrorResponse, PanelError};

fn status_of(state: &AppState) -> ServerStatusResponse {
    let xray = state.reconciler.xray();
    ServerStatusResponse {
        xray: xray.status(),
        online_clients: xray.online_clients(),
        output: xray.result(),
    }
}

/// `GET /server/status` — Xray state, version and last error.
#[utoipa::path(
    get,
    path = "/api/v1/server/status",
    tag = "Server",
    summary = "Xray status",
    description = "Returns the lifecycle state of the Xray process, its version, the last start or crash error, and the emails online at the last stats tick.",
    responses(
        (status = 200, description = "Current status", body = ServerStatusResponse),
    )
)]
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(status_of(&state))
}

/// `POST /server/restart` — Reassemble and restart Xray now.
///
/// # Errors
///
/// Returns [`PanelError`] if the restart failed; the failure is also shown
/// by the status endpoint.
#[utoipa::path(
    post,
    path = "/api/v1/server/restart",
    tag = "Server",
    summary = "Restart Xray",
    description = "Assembles the config from the repository and restarts Xray even if the config is unchanged.",
    responses(
        (status = 200, description = "Xray restarted", body = ServerStatusResponse),
        (status = 503, description = "Xray could not be started", body = ErrorResponse),
        (status = 504, description = "Xray API did not come up", body = ErrorResponse),
    )
)]
pub async fn restart(State(state): State<AppState>) -> Result<impl IntoResponse, PanelError> {
    state.reconciler.reconcile(true).await?;
    Ok(Json(status_of(&state)))
}

/// `POST /server/stop` — Stop Xray until the next restart.
///
/// # Errors
///
/// Returns [`PanelError::NotRunning`] if Xray was not running.
#[utoipa::path(
    post,
    path = "/api/v1/server/stop",
    tag = "Server",
    summary = "Stop Xray",
    description = "Stops the Xray process. A manual stop is not treated as a crash, so Xray stays down until restarted.",
    responses(
        (status = 200, description = "Xray stopped", body = ServerStatusResponse),
        (status = 409, description = "Xray was not running", body = ErrorResponse),
    )
)]
pub async fn stop(State(state): State<AppState>) -> Result<impl IntoResponse, PanelError> {
    state.reconciler.stop().await?;
    Ok(Json(status_of(&state)))
}

/// `GET /server/config` — The config the repository currently assembles to.
///
/// # Errors
///
/// Returns [`PanelError`] if the repository cannot be read.
#[utoipa::path(
    get,
    path = "/api/v1/server/config",
    tag = "Server",
    summary = "Assembled Xray config",
    description = "Returns the Xray document built from the template and the stored inbounds, as the next restart would write it (before the API port is chosen).",
    responses(
        (status = 200, description = "Xray config", body = serde_json::Value),
    )
)]
pub async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, PanelError> {
    let config = state.reconciler.assemble_config().await?;
    Ok(Json(config))
}

/// Server routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/server/status", get(get_status))
        .route("/server/restart", post(restart))
        .route("/server/stop", post(stop))
        .route("/server/config", get(get_config))
}
