//! Link history and short links.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{RecentLinksParams, ShortenRequest};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, PanelError};
use crate::persistence::models::{LinkRecord, ShortLink};

/// `GET /links/recent` — The newest generated links.
///
/// # Errors
///
/// Returns [`PanelError`] on repository failure.
#[utoipa::path(
    get,
    path = "/api/v1/links/recent",
    tag = "Links",
    summary = "Recent links",
    params(RecentLinksParams),
    responses(
        (status = 200, description = "Newest first, at most 10", body = Vec<LinkRecord>),
    )
)]
pub async fn recent(
    State(state): State<AppState>,
    Query(params): Query<RecentLinksParams>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.inbounds.recent_links(params.limit).await?))
}

/// `POST /links/short` — Shorten a link, reusing an existing code.
///
/// # Errors
///
/// Returns [`PanelError::InvalidRequest`] for an empty link.
#[utoipa::path(
    post,
    path = "/api/v1/links/short",
    tag = "Links",
    summary = "Shorten a link",
    request_body = ShortenRequest,
    responses(
        (status = 201, description = "Short code", body = ShortLink),
        (status = 400, description = "Empty link", body = ErrorResponse),
    )
)]
pub async fn shorten(
    State(state): State<AppState>,
    Json(req): Json<ShortenRequest>,
) -> Result<impl IntoResponse, PanelError> {
    let short = state.inbounds.shorten(&req.link).await?;
    Ok((StatusCode::CREATED, Json(short)))
}

/// `GET /s/{code}` — Redirect to the link behind a short code.
///
/// # Errors
///
/// Returns [`PanelError::NotFound`] for unknown codes.
#[utoipa::path(
    get,
    path = "/s/{code}",
    tag = "Links",
    summary = "Follow a short link",
    params(("code" = String, Path, description = "Short code")),
    responses(
        (status = 307, description = "Redirect to the stored link"),
        (status = 404, description = "Unknown code", body = ErrorResponse),
    )
)]
pub async fn follow(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    let link = state.inbounds.resolve(&code).await?;
    Ok(Redirect::temporary(&link))
}

/// Link routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/links/recent", get(recent))
        .route("/links/short", post(shorten))
}

/// Short-link redirect, mounted at the root.
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/s/{code}", get(follow))
}
