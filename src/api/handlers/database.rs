//! Database export and import.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::ImportResponse;
use crate::app_state::AppState;
use crate::error::{ErrorResponse, PanelError};

/// Upper bound on an uploaded database file.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// `GET /db` — Download the database file.
///
/// # Errors
///
/// Returns [`PanelError`] if the file cannot be read.
#[utoipa::path(
    get,
    path = "/api/v1/db",
    tag = "Database",
    summary = "Export the database",
    description = "Checkpoints the write-ahead log and returns the SQLite file.",
    responses(
        (status = 200, description = "SQLite file", body = Vec<u8>, content_type = "application/octet-stream"),
        (status = 400, description = "Database is not file-backed", body = ErrorResponse),
    )
)]
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, PanelError> {
    let bytes = state.database.export().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"x-ui.db\""),
        ],
        bytes,
    ))
}

/// `POST /db` — Replace the database with an uploaded file.
///
/// # Errors
///
/// Returns [`PanelError::InvalidDb`] if the upload is not a sound SQLite
/// file; the live database is kept in that case.
#[utoipa::path(
    post,
    path = "/api/v1/db",
    tag = "Database",
    summary = "Import a database",
    description = "Validates the upload, stops Xray, swaps the file in, migrates it and restarts Xray. The previous file is kept as a backup.",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Database replaced", body = ImportResponse),
        (status = 400, description = "Upload rejected", body = ErrorResponse),
    )
)]
pub async fn import(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, PanelError> {
    state.database.import(&body).await?;
    Ok(Json(ImportResponse { bytes: body.len() }))
}

/// Database routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/db",
        get(export)
            .post(import)
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
    )
}
