use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{
    admin::reload_handler, ask::ask_handler, health::health, metrics::metrics_handler,
    schemas::schemas_handler,
};
use crate::middleware::trace_with_correlation;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ask", post(ask_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/schemas", get(schemas_handler))
        .route("/metrics", get(metrics_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(trace_with_correlation))
        .with_state(state)
}
