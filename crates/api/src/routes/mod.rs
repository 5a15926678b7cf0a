//! API routes

pub mod billing;
pub mod health;
pub mod usage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Chat application routes (auth via bearer token extractor)
    let chat_api_routes = Router::new()
        .route("/usage/status", get(usage::usage_status))
        .route("/subscription/status", get(billing::subscription_status))
        .route(
            "/subscription/reset-message-count",
            post(billing::reset_message_count),
        )
        // Stripe webhook (public, uses signature verification)
        .route("/stripe/webhook", post(billing::webhook));

    Router::new()
        .merge(health_routes)
        .nest("/chat/api", chat_api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        // Webhook payloads are small; anything larger is not ours
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
