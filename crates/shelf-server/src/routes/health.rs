//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Reports broker activity; `degraded` once the broker has stopped.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let store = if state.config.uses_database() {
        "postgres"
    } else {
        "memory"
    };

    let body = match state.broker.stats().await {
        Ok(stats) => json!({
            "status": "healthy",
            "service": "shelf-server",
            "version": env!("CARGO_PKG_VERSION"),
            "store": store,
            "broker": stats,
        }),
        Err(e) => json!({
            "status": "degraded",
            "service": "shelf-server",
            "version": env!("CARGO_PKG_VERSION"),
            "store": store,
            "error": e.to_string(),
        }),
    };

    Json(body)
}
