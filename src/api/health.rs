/// Health and metrics endpoints
use crate::context::AppContext;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;

/// Liveness probe
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus text-format metrics
pub async fn metrics() -> String {
    crate::metrics::render_metrics()
}

/// Server description (com.atproto.server.describeServer)
pub async fn describe_server(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "availableUserDomains": [],
        "did": format!("did:web:{}", ctx.config.service.hostname),
        "links": {
            "privacyPolicy": null,
            "termsOfService": null
        }
    }))
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/xrpc/com.atproto.server.describeServer", get(describe_server))
}
