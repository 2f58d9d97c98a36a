//! HTTP API route definitions

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/crawl", post(handlers::submit_crawl))
        .route("/api/status", get(handlers::crawl_status))
        .route("/api/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::track_metrics,
        ))
        .with_state(state)
}
