//! API route wiring

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::api::handlers::{book, orders};
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/bets", post(orders::place_bet).get(orders::get_active_bets))
        .route("/bets/:id", get(orders::get_bet))
        .route("/bets/:id/cancel", post(orders::cancel_bet))
        .route("/bets/:id/settle", post(orders::settle_bet))
        .route("/bets/:id/matches", get(orders::get_bet_matches))
        .route("/users/:user_id/bets", get(orders::get_user_bets))
        .route("/events/:market_id/bets", get(orders::get_market_bets))
        .route("/sagas/:saga_id/bet", get(orders::get_saga_bet))
        .route("/book/:market_id/:selection_id", get(book::get_book))
        .route(
            "/book/:market_id/:selection_id/orders",
            get(orders::get_book_orders),
        )
        .route("/stats", get(book::get_stats))
        .with_state(state)
}
