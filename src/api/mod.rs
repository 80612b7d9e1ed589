//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Resource endpoints are mounted under `/api/v1`; `/health` and the
//! short-link redirect `/s/{code}` live at the root.

pub mod dto;
pub mod handlers;

use axum::Router;
use utoipa::OpenApi;

use crate::app_state::AppState;

/// OpenAPI document for every REST endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "xray-panel", description = "Xray configuration and lifecycle API"),
    paths(
        handlers::inbounds::list_inbounds,
        handlers::inbounds::create_inbound,
        handlers::inbounds::get_inbound,
        handlers::inbounds::update_inbound,
        handlers::inbounds::delete_inbound,
        handlers::inbounds::add_client,
        handlers::inbounds::reset_traffic,
        handlers::inbounds::delete_depleted,
        handlers::clients::get_client,
        handlers::clients::update_client,
        handlers::clients::delete_client,
        handlers::clients::reset_traffic,
        handlers::clients::toggle,
        handlers::clients::links,
        handlers::clients::ips,
        handlers::links::recent,
        handlers::links::shorten,
        handlers::links::follow,
        handlers::server::get_status,
        handlers::server::restart,
        handlers::server::stop,
        handlers::server::get_config,
        handlers::database::export,
        handlers::database::import,
        handlers::system::health_handler,
    ),
    tags(
        (name = "Inbounds", description = "Inbound CRUD"),
        (name = "Clients", description = "Client operations keyed by email"),
        (name = "Links", description = "Link history and short links"),
        (name = "Server", description = "Xray lifecycle"),
        (name = "Database", description = "Database export and import"),
        (name = "System", description = "Health"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::links::public_routes())
        .merge(handlers::system::routes());
    with_docs(router)
}

#[cfg(feature = "swagger-ui")]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    use utoipa_swagger_ui::SwaggerUi;
    router.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

#[cfg(not(feature = "swagger-ui"))]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    router
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_resource_paths() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/inbounds"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/clients/{email}/links"));
        assert!(paths.iter().any(|p| p.as_str() == "/s/{code}"));
        assert!(paths.iter().any(|p| p.as_str() == "/health"));
    }
}
