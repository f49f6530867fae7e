//! Router configuration for the sentiment API.

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sentiment/current", get(handlers::sentiment_current))
        .route("/sentiment/day", get(handlers::sentiment_day))
        .route("/sentiment/week", get(handlers::sentiment_week))
        .route("/sentiment/month", get(handlers::sentiment_month))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
