//! Health, readiness and metrics endpoints

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

/// Liveness: the process is up
pub async fn health() -> &'static str {
    "OK"
}

/// Readiness: database reachable within budget and the event bus producer
/// handle initialized
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database_ok = crate::db::ping(&state.pool).await;
    let producer_ok = state.producer_ready;

    let body = json!({
        "environment": state.config.environment,
        "database": database_ok,
        "producer": producer_ok,
    });

    if database_ok && producer_ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
