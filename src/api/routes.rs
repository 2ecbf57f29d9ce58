//! API route definitions

use crate::manager::LifecycleManager;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    /// Client used for relaying requests to backends
    pub http: reqwest::Client,
    pub request_timeout: Duration,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and introspection
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/models", get(handlers::list_models))
        // OpenAI-compatible proxy routes, all dispatched the same way
        .route("/v1/completions", post(handlers::dispatch))
        .route("/v1/chat/completions", post(handlers::dispatch))
        .route("/v1/embeddings", post(handlers::dispatch))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
