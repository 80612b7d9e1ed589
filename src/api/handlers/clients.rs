//! Client handlers, keyed by the panel-unique email.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::domain::{Client, ShareLink};
use crate::error::{ErrorResponse, PanelError};
use crate::persistence::ClientRecord;
use crate::persistence::models::ClientIps;

/// `GET /clients/{email}` — A client with its counters.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown emails.
#[utoipa::path(
    get,
    path = "/api/v1/clients/{email}",
    tag = "Clients",
    summary = "Get a client",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 200, description = "Client", body = ClientRecord),
        (status = 404, description = "Client not found", body = ErrorResponse),
    )
)]
pub async fn get_client(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.get_client(&email).await?))
}

/// `PUT /clients/{email}` — Replace a client.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] or [`PanelError::Conflict`].
#[utoipa::path(
    put,
    path = "/api/v1/clients/{email}",
    tag = "Clients",
    summary = "Update a client",
    description = "Replaces the client. The email may change; counters follow the client.",
    params(("email" = String, Path, description = "Current client email")),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Client updated", body = ClientRecord),
        (status = 404, description = "Client not found", body = ErrorResponse),
        (status = 409, description = "New email already in use", body = ErrorResponse),
    )
)]
pub async fn update_client(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(client): Json<Client>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.update_client(&email, &client).await?))
}

/// `DELETE /clients/{email}` — Remove a client.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown emails.
#[utoipa::path(
    delete,
    path = "/api/v1/clients/{email}",
    tag = "Clients",
    summary = "Delete a client",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 204, description = "Client deleted"),
        (status = 404, description = "Client not found", body = ErrorResponse),
    )
)]
pub async fn delete_client(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    state.inbounds.delete_client(&email).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /clients/{email}/reset-traffic` — Zero counters and re-enable.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown emails.
#[utoipa::path(
    post,
    path = "/api/v1/clients/{email}/reset-traffic",
    tag = "Clients",
    summary = "Reset client traffic",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 200, description = "Counters reset", body = ClientRecord),
        (status = 404, description = "Client not found", body = ErrorResponse),
    )
)]
pub async fn reset_traffic(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    state.inbounds.reset_client_traffic(&email).await?;
    Ok(Json(state.inbounds.get_client(&email).await?))
}

/// `POST /clients/{email}/toggle` — Flip the enable flag.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown emails.
#[utoipa::path(
    post,
    path = "/api/v1/clients/{email}/toggle",
    tag = "Clients",
    summary = "Enable or disable a client",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 200, description = "New enable state", body = serde_json::Value),
        (status = 404, description = "Client not found", body = ErrorResponse),
    )
)]
pub async fn toggle(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    let enable = state.inbounds.toggle_client(&email).await?;
    Ok(Json(serde_json::json!({ "email": email, "enable": enable })))
}

/// `GET /clients/{email}/links` — Share links for the client.
///
/// # Errors
///
/// Returns [`PanelError`] for unknown emails or protocols without links.
#[utoipa::path(
    get,
    path = "/api/v1/clients/{email}/links",
    tag = "Clients",
    summary = "Client share links",
    description = "Renders one link per external proxy (or one for the inbound itself) and records them in the link history.",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 200, description = "Share links", body = Vec<ShareLink>),
        (status = 400, description = "Protocol has no share links", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse),
    )
)]
pub async fn links(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.client_links(&email).await?))
}

/// `GET /clients/{email}/ips` — Source IPs last seen for the client.
///
/// # Errors
///
/// Returns [`PanelError`] on repository failure.
#[utoipa::path(
    get,
    path = "/api/v1/clients/{email}/ips",
    tag = "Clients",
    summary = "Client source IPs",
    params(("email" = String, Path, description = "Client email")),
    responses(
        (status = 200, description = "Recorded IPs", body = ClientIps),
    )
)]
pub async fn ips(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.client_ips(&email).await?))
}

/// Client routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/clients/{email}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route("/clients/{email}/reset-traffic", post(reset_traffic))
        .route("/clients/{email}/toggle", post(toggle))
        .route("/clients/{email}/links", get(links))
        .route("/clients/{email}/ips", get(ips))
}
