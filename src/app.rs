use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bootstrap::BootstrapStatus;
use crate::locks::{self, LockManager};
use crate::metrics::Metrics;

// Embedded OpenAPI document
const OPENAPI_SPEC: &str = include_str!("../openapi.yaml");

#[derive(Clone)]
pub struct AppState {
    pub lock_manager: LockManager,
    pub bootstrap: BootstrapStatus,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Lock routes
        .route("/lock", get(locks::lock))
        .route("/release", get(locks::release))
        .route("/status", get(locks::status))
        // Documentation routes
        .route("/openapi.yaml", get(openapi_spec))
        .route("/docs", get(api_docs))
        // Operational routes
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_snapshot))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.bootstrap.is_healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED")
    }
}

async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn openapi_spec() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/yaml")], OPENAPI_SPEC)
}

// Scalar API reference page backed by /openapi.yaml
async fn api_docs() -> impl IntoResponse {
    let html_content = r#"<!DOCTYPE html>
<html>
<head>
    <title>zklock API Documentation</title>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
</head>
<body>
    <script
        id="api-reference"
        data-url="/openapi.yaml"
        src="https://cdn.jsdelivr.net/npm/@scalar/api-reference">
    </script>
</body>
</html>"#;

    Html(html_content)
}
