use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Two-phase query protocol
            .route("/query", post(handlers::api::submit_query))
            .route("/query/{id}/select", post(handlers::api::select_interpretation))
            .route("/query/{id}/feedback", post(handlers::api::submit_feedback))
            // Audit surface
            .route("/query/{id}/trace", get(handlers::api::get_trace))
            .route("/metrics", get(handlers::api::get_metrics))
            // Schema management
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
