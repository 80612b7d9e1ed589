//! Inbound CRUD handlers and per-inbound client operations.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{InboundRequest, InboundResponse};
use crate::app_state::AppState;
use crate::domain::Client;
use crate::error::{ErrorResponse, PanelError};
use crate::persistence::ClientRecord;

/// `GET /inbounds` — All inbounds with client counters.
///
/// # Errors
///
/// Returns [`PanelError`] on repository failure.
#[utoipa::path(
    get,
    path = "/api/v1/inbounds",
    tag = "Inbounds",
    summary = "List inbounds",
    responses(
        (status = 200, description = "Every inbound", body = Vec<InboundResponse>),
    )
)]
pub async fn list_inbounds(State(state): State<AppState>) -> Result<impl IntoResponse, PanelError> {
    let inbounds = state.inbounds.list_inbounds().await?;
    let body: Vec<InboundResponse> = inbounds.into_iter().map(InboundResponse::from).collect();
    Ok(Json(body))
}

/// `POST /inbounds` — Create an inbound.
///
/// # Errors
///
/// Returns [`PanelError`] on invalid settings or a port/email conflict.
#[utoipa::path(
    post,
    path = "/api/v1/inbounds",
    tag = "Inbounds",
    summary = "Create an inbound",
    description = "Stores the inbound with one traffic row per client and schedules an Xray restart.",
    request_body = InboundRequest,
    responses(
        (status = 201, description = "Inbound created", body = InboundResponse),
        (status = 400, description = "Invalid protocol or settings", body = ErrorResponse),
        (status = 409, description = "Port or client email already in use", body = ErrorResponse),
    )
)]
pub async fn create_inbound(
    State(state): State<AppState>,
    Json(req): Json<InboundRequest>,
) -> Result<impl IntoResponse, PanelError> {
    let created = state.inbounds.add_inbound(&req.into_inbound()).await?;
    Ok((StatusCode::CREATED, Json(InboundResponse::from(created))))
}

/// `GET /inbounds/{id}` — One inbound.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown ids.
#[utoipa::path(
    get,
    path = "/api/v1/inbounds/{id}",
    tag = "Inbounds",
    summary = "Get an inbound",
    params(("id" = i64, Path, description = "Inbound id")),
    responses(
        (status = 200, description = "Inbound", body = InboundResponse),
        (status = 404, description = "Inbound not found", body = ErrorResponse),
    )
)]
pub async fn get_inbound(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PanelError> {
    let inbound = state.inbounds.get_inbound(id).await?;
    Ok(Json(InboundResponse::from(inbound)))
}

/// `PUT /inbounds/{id}` — Replace an inbound.
///
/// # Errors
///
/// Returns [`PanelError`] on validation failure, conflict or unknown id.
#[utoipa::path(
    put,
    path = "/api/v1/inbounds/{id}",
    tag = "Inbounds",
    summary = "Update an inbound",
    description = "Replaces the inbound. Counters of clients that stay are kept; removed clients lose their rows.",
    params(("id" = i64, Path, description = "Inbound id")),
    request_body = InboundRequest,
    responses(
        (status = 200, description = "Inbound updated", body = InboundResponse),
        (status = 404, description = "Inbound not found", body = ErrorResponse),
        (status = 409, description = "Port or client email already in use", body = ErrorResponse),
    )
)]
pub async fn update_inbound(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<InboundRequest>,
) -> Result<impl IntoResponse, PanelError> {
    let updated = state.inbounds.update_inbound(id, &req.into_inbound()).await?;
    Ok(Json(InboundResponse::from(updated)))
}

/// `DELETE /inbounds/{id}` — Delete an inbound and its client rows.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown ids.
#[utoipa::path(
    delete,
    path = "/api/v1/inbounds/{id}",
    tag = "Inbounds",
    summary = "Delete an inbound",
    params(("id" = i64, Path, description = "Inbound id")),
    responses(
        (status = 204, description = "Inbound deleted"),
        (status = 404, description = "Inbound not found", body = ErrorResponse),
    )
)]
pub async fn delete_inbound(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PanelError> {
    state.inbounds.delete_inbound(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /inbounds/{id}/clients` — Add a client to an inbound.
///
/// # Errors
///
/// Returns [`PanelError`] for unknown inbounds, client-less protocols or a
/// taken email.
#[utoipa::path(
    post,
    path = "/api/v1/inbounds/{id}/clients",
    tag = "Inbounds",
    summary = "Add a client",
    params(("id" = i64, Path, description = "Inbound id")),
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Client added", body = ClientRecord),
        (status = 400, description = "Inbound protocol has no clients", body = ErrorResponse),
        (status = 409, description = "Email already in use", body = ErrorResponse),
    )
)]
pub async fn add_client(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(client): Json<Client>,
) -> Result<impl IntoResponse, PanelError> {
    let record = state.inbounds.add_client(id, &client).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `POST /inbounds/{id}/reset-traffic` — Zero every client counter and
/// re-enable cut-off clients.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown ids.
#[utoipa::path(
    post,
    path = "/api/v1/inbounds/{id}/reset-traffic",
    tag = "Inbounds",
    summary = "Reset client traffic of an inbound",
    params(("id" = i64, Path, description = "Inbound id")),
    responses(
        (status = 200, description = "Number of rows reset", body = serde_json::Value),
        (status = 404, description = "Inbound not found", body = ErrorResponse),
    )
)]
pub async fn reset_traffic(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PanelError> {
    let reset = state.inbounds.reset_all_client_traffic(id).await?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

/// `POST /inbounds/{id}/delete-depleted` — Remove used-up disabled clients.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown ids.
#[utoipa::path(
    post,
    path = "/api/v1/inbounds/{id}/delete-depleted",
    tag = "Inbounds",
    summary = "Delete depleted clients",
    description = "Removes the disabled clients whose quota is used up or whose expiry has passed.",
    params(("id" = i64, Path, description = "Inbound id")),
    responses(
        (status = 200, description = "Emails removed", body = Vec<String>),
        (status = 404, description = "Inbound not found", body = ErrorResponse),
    )
)]
pub async fn delete_depleted(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.delete_depleted_clients(id).await?))
}

/// Inbound routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/inbounds", get(list_inbounds).post(create_inbound))
        .route(
            "/inbounds/{id}",
            get(get_inbound).put(update_inbound).delete(delete_inbound),
        )
        .route("/inbounds/{id}/clients", post(add_client))
        .route("/inbounds/{id}/reset-traffic", post(reset_traffic))
        .route("/inbounds/{id}/delete-depleted", post(delete_depleted))
}
