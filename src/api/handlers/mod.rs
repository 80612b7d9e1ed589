//! REST endpoint handlers organized by resource.

pub mod clients;
pub mod database;
pub mod inbounds;
pub mod links;
pub mod server;
pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(inbounds::routes())
        .merge(clients::routes())
        .merge(links::routes())
        .merge(server::routes())
        .merge(database::routes())
}
