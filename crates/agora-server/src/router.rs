use agora_protocol::endpoints;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handler::{self, AppState};

/// Build the axum router with all node endpoints.
pub fn build_router(node: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(handler::health_handler))
        .route(endpoints::STATS, get(handler::stats_handler))
        .route(endpoints::POST, get(handler::post_handler))
        .route(endpoints::POST_BODY, get(handler::post_body_handler))
        .route(endpoints::CONTENT, get(handler::content_handler))
        .route(endpoints::SYNC, post(handler::sync_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}
