//! Order book snapshot handler

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use std::sync::Arc;

use crate::services::matching::engine::EngineStats;
use crate::services::matching::BookSnapshot;
use crate::AppState;

/// Aggregated price ladders for one (market, selection)
/// GET /book/:market_id/:selection_id
pub async fn get_book(
    State(state): State<Arc<AppState>>,
    Path((market_id, selection_id)): Path<(String, String)>,
) -> Json<BookSnapshot> {
    let snapshot = state
        .engine
        .snapshot(&market_id, &selection_id)
        .await
        .unwrap_or_else(|| BookSnapshot {
            market_id,
            selection_id,
            back_levels: Vec::new(),
            lay_levels: Vec::new(),
            updated_at: Utc::now(),
        });

    Json(snapshot)
}

/// Engine-wide book statistics
/// GET /stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats().await)
}
