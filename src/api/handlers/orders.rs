//! Bet order handlers
//!
//! Write operations require a non-empty idempotency key; decimal fields
//! travel as decimal strings.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Match, Order, OrderSide, OrderStatus};
use crate::services::orders::{
    CancelOrderRequest, PlaceOrderRequest, SettleOrderRequest, SettlementResult,
};
use crate::AppState;

use super::{map_service_error, ApiError};

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(0)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0)
    }
}

/// Place a bet
/// POST /bets
pub async fn place_bet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let order = state
        .order_service
        .place_order(req)
        .await
        .map_err(map_service_error)?;

    Ok((StatusCode::CREATED, Json(order)))
}

#[derive(Debug, Deserialize)]
pub struct CancelBetBody {
    #[serde(default)]
    pub saga_id: Option<Uuid>,
    pub idempotency_key: String,
}

/// Cancel a bet
/// POST /bets/:id/cancel
pub async fn cancel_bet(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(body): Json<CancelBetBody>,
) -> Result<StatusCode, ApiError> {
    state
        .order_service
        .cancel_order(CancelOrderRequest {
            order_id,
            saga_id: body.saga_id,
            idempotency_key: body.idempotency_key,
        })
        .await
        .map_err(map_service_error)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SettleBetBody {
    pub result: SettlementResult,
    pub payout: Decimal,
    #[serde(default)]
    pub saga_id: Option<Uuid>,
    pub idempotency_key: String,
}

/// Settle a bet
/// POST /bets/:id/settle
pub async fn settle_bet(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(body): Json<SettleBetBody>,
) -> Result<StatusCode, ApiError> {
    state
        .order_service
        .settle_order(SettleOrderRequest {
            order_id,
            result: body.result,
            payout: body.payout,
            saga_id: body.saga_id,
            idempotency_key: body.idempotency_key,
        })
        .await
        .map_err(map_service_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Bet status
/// GET /bets/:id
pub async fn get_bet(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = state
        .order_service
        .get_order_by_id(order_id)
        .await
        .map_err(map_service_error)?;

    Ok(Json(order))
}

/// Matches a bet participated in
/// GET /bets/:id/matches
pub async fn get_bet_matches(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Match>>, ApiError> {
    let matches = state
        .order_service
        .get_order_matches(order_id)
        .await
        .map_err(map_service_error)?;

    Ok(Json(matches))
}

/// Active bets across markets
/// GET /bets
pub async fn get_active_bets(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state
        .order_service
        .get_active_orders(page.limit(), page.offset())
        .await
        .map_err(map_service_error)?;

    Ok(Json(orders))
}

/// A user's bets, newest first
/// GET /users/:user_id/bets
pub async fn get_user_bets(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state
        .order_service
        .get_user_orders(user_id, page.limit(), page.offset())
        .await
        .map_err(map_service_error)?;

    Ok(Json(orders))
}

/// The bet created by a distributed workflow step
/// GET /sagas/:saga_id/bet
pub async fn get_saga_bet(
    State(state): State<Arc<AppState>>,
    Path(saga_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = state
        .order_service
        .get_order_by_saga(saga_id)
        .await
        .map_err(map_service_error)?;

    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct BookOrdersQuery {
    pub side: OrderSide,
    #[serde(default = "default_book_status")]
    pub status: OrderStatus,
    pub limit: Option<i64>,
}

fn default_book_status() -> OrderStatus {
    OrderStatus::Pending
}

/// Resting orders on one side of a book, best price first
/// GET /book/:market_id/:selection_id/orders
pub async fn get_book_orders(
    State(state): State<Arc<AppState>>,
    Path((market_id, selection_id)): Path<(String, String)>,
    Query(query): Query<BookOrdersQuery>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state
        .order_service
        .get_book_orders(
            &market_id,
            &selection_id,
            query.side,
            query.status,
            query.limit.unwrap_or(0),
        )
        .await
        .map_err(map_service_error)?;

    Ok(Json(orders))
}

/// Live bets on a market
/// GET /events/:market_id/bets
pub async fn get_market_bets(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = state
        .order_service
        .get_orders_by_market(&market_id, page.limit(), page.offset())
        .await
        .map_err(map_service_error)?;

    Ok(Json(orders))
}
