// Router configuration

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    handlers::{
        admin_handlers::export_search_handler, archive_handlers::archive_handler,
        health_handlers::health_handler, info_handlers::*,
    },
    state::AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Legacy per-reference endpoints
        .route("/charm-info", get(charm_info_handler))
        .route("/charm-event", get(charm_event_handler))
        // Admin
        .route("/admin/export-search", post(export_search_handler))
        // Versioned archive downloads, e.g. /v4/precise/wordpress-23/archive
        .route("/{version}/{*rest}", get(archive_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
