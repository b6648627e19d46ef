use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Liveness plus a few cheap in-process gauges.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "payhook-api",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.app_env,
        "realtime_connections": state.registry.connection_count(),
        "rate_limit_enabled": state.rate_limiter.is_some(),
    }))
}
