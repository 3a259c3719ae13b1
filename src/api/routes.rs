//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/proxy", proxy_routes())
        .with_state(state)
}

fn proxy_routes() -> Router<AppState> {
    Router::new()
        .route("/request", post(handlers::proxy::mediate_request))
        .route("/status", get(handlers::proxy::proxy_status))
        .route("/rotate", post(handlers::proxy::rotate))
        .route("/circuits", get(handlers::proxy::circuits))
}
