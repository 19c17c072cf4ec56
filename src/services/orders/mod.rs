//! Order service
//!
//! Coordinator for the order lifecycle: validation, idempotency, the
//! transaction boundary, the matching walk and the outbox records that make
//! every state change observable downstream.
//!
//! # Locking discipline
//!
//! Place and cancel acquire the book's exclusive lock strictly before
//! opening the database transaction, uniformly, so a book lock is never
//! requested while a row lock is held. Matching is planned against the
//! locked book without mutating it; the in-memory book is only updated after
//! the transaction commits, so a rollback leaves the book untouched.

pub mod types;

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::outbox::{aggregate_type, event_type};
use crate::models::{Match, Order, OrderSide, OrderStatus, OutboxEvent};
use crate::observability::Metrics;
use crate::repository::{
    compute_request_hash, IdempotencyRepository, MatchRepository, OrderRepository,
    OutboxRepository,
};
use crate::services::matching::{Fill, MatchingEngine, PlacementPlan};

pub use types::{
    CancelOrderRequest, OrderServiceError, PlaceOrderRequest, SettleOrderRequest, SettlementResult,
};

/// How long an idempotency key stays bound to its request
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 100;

pub struct OrderService {
    pool: PgPool,
    orders: OrderRepository,
    matches: MatchRepository,
    outbox: OutboxRepository,
    idempotency: IdempotencyRepository,
    engine: Arc<MatchingEngine>,
    metrics: Arc<Metrics>,
}

impl OrderService {
    pub fn new(
        pool: PgPool,
        orders: OrderRepository,
        matches: MatchRepository,
        outbox: OutboxRepository,
        idempotency: IdempotencyRepository,
        engine: Arc<MatchingEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            orders,
            matches,
            outbox,
            idempotency,
            engine,
            metrics,
        }
    }

    fn idempotency_ttl() -> Duration {
        Duration::hours(IDEMPOTENCY_TTL_HOURS)
    }

    // ========================================================================
    // Place
    // ========================================================================

    /// Place a bet order: match it against the book and persist the order,
    /// its matches and their outbox events in one transaction.
    pub async fn place_order(
        &self,
        req: PlaceOrderRequest,
    ) -> Result<Order, OrderServiceError> {
        let started = Instant::now();
        let result = self.place_order_inner(req).await;

        let status = if result.is_ok() { "success" } else { "failure" };
        self.metrics
            .order_placement_duration
            .with_label_values(&[status])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn place_order_inner(
        &self,
        req: PlaceOrderRequest,
    ) -> Result<Order, OrderServiceError> {
        let side = Self::validate_place_request(&req)?;

        let request_hash = compute_request_hash(&req)?;

        if let Some(cached) = self
            .idempotency
            .check(&req.idempotency_key, &request_hash)
            .await?
        {
            let order: Order = serde_json::from_value(cached)?;
            info!(
                order_id = %order.id,
                idempotency_key = %req.idempotency_key,
                "returning cached order from idempotency check"
            );
            return Ok(order);
        }

        // Book lock first, then the transaction; held until the in-memory
        // apply after commit.
        let book = self.engine.book(&req.market_id, &req.selection_id);
        let mut state = book.write().await;

        let mut tx = self.pool.begin().await?;

        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            market_id: req.market_id.clone(),
            selection_id: req.selection_id.clone(),
            side,
            price: req.odds,
            size: req.amount,
            size_matched: Decimal::ZERO,
            size_remaining: req.amount,
            status: OrderStatus::Pending,
            reservation_id: req.reservation_id,
            saga_id: req.saga_id,
            idempotency_key: req.idempotency_key.clone(),
            placed_at: now,
            matched_at: None,
            cancelled_at: None,
            version: 1,
        };

        let matching_started = Instant::now();
        let plan = state.plan(&order);
        self.metrics
            .order_matching_duration
            .observe(matching_started.elapsed().as_secs_f64());

        order.size_matched = plan.taker_size_matched;
        order.size_remaining = plan.taker_size_remaining;
        order.status = plan.taker_status;
        if plan.has_fills() {
            order.matched_at = Some(now);
        }
        debug_assert!(order.is_consistent());

        self.orders.create(&mut tx, &order).await?;

        self.outbox
            .create(&mut tx, &self.placed_event(&order))
            .await?;

        for fill in &plan.fills {
            self.orders
                .update_matched(
                    &mut tx,
                    fill.maker.order_id,
                    fill.maker.size_matched,
                    fill.maker.size_remaining,
                    fill.maker.status,
                    fill.maker.version,
                )
                .await?;

            self.matches.create(&mut tx, &fill.match_record).await?;

            self.outbox
                .create(&mut tx, &self.match_created_event(fill, order.saga_id))
                .await?;

            self.outbox
                .create(&mut tx, &self.maker_matched_event(fill, side))
                .await?;
        }

        if plan.has_fills() {
            self.outbox
                .create(&mut tx, &self.taker_matched_event(&order))
                .await?;
        }

        self.idempotency
            .store_in_transaction(
                &mut tx,
                &req.idempotency_key,
                &request_hash,
                &order,
                Self::idempotency_ttl(),
            )
            .await?;

        tx.commit().await?;

        // Commit succeeded; now the book may change.
        state.apply(&order, &plan);
        drop(state);

        self.record_place_metrics(&order, &plan);

        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            market_id = %order.market_id,
            selection_id = %order.selection_id,
            side = %order.side,
            size = %order.size,
            odds = %order.price,
            matches = plan.fills.len(),
            status = %order.status,
            "order placed"
        );

        Ok(order)
    }

    fn validate_place_request(req: &PlaceOrderRequest) -> Result<OrderSide, OrderServiceError> {
        if req.market_id.trim().is_empty() {
            return Err(OrderServiceError::Validation("market_id is required".into()));
        }
        if req.selection_id.trim().is_empty() {
            return Err(OrderServiceError::Validation(
                "selection_id is required".into(),
            ));
        }
        if req.idempotency_key.trim().is_empty() {
            return Err(OrderServiceError::Validation(
                "idempotency_key is required".into(),
            ));
        }
        if req.amount <= Decimal::ZERO {
            return Err(OrderServiceError::Validation(
                "amount must be positive".into(),
            ));
        }
        if req.odds <= Decimal::ONE {
            return Err(OrderServiceError::Validation(
                "odds must be greater than 1".into(),
            ));
        }

        req.bet_type
            .parse::<OrderSide>()
            .map_err(OrderServiceError::Validation)
    }

    fn record_place_metrics(&self, order: &Order, plan: &PlacementPlan) {
        self.metrics
            .orders_placed_total
            .with_label_values(&[order.market_id.as_str(), &order.side.to_string()])
            .inc();
        self.metrics
            .order_amount_total
            .inc_by(order.size.to_f64().unwrap_or(0.0));

        if !plan.is_fully_matched() {
            // The residual rests in the book
            self.metrics.active_orders.inc();
        }

        for fill in &plan.fills {
            let match_type = if fill.maker.status == OrderStatus::Matched {
                "full"
            } else {
                "partial"
            };
            self.metrics
                .orders_matched_total
                .with_label_values(&[match_type])
                .inc();
            if fill.maker.status == OrderStatus::Matched {
                // The resting order left the book
                self.metrics.active_orders.dec();
            }
        }
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancel an active order, removing it from the book
    pub async fn cancel_order(&self, req: CancelOrderRequest) -> Result<(), OrderServiceError> {
        if req.idempotency_key.trim().is_empty() {
            return Err(OrderServiceError::Validation(
                "idempotency_key is required".into(),
            ));
        }

        let request_hash = compute_request_hash(&req)?;

        if self
            .idempotency
            .check(&req.idempotency_key, &request_hash)
            .await?
            .is_some()
        {
            info!(
                order_id = %req.order_id,
                idempotency_key = %req.idempotency_key,
                "cancel already processed (idempotency)"
            );
            return Ok(());
        }

        // Resolve the book before taking any lock; the row re-read under
        // FOR UPDATE below is authoritative.
        let preview = self.orders.get_by_id(req.order_id).await?;

        let book = self
            .engine
            .book(&preview.market_id, &preview.selection_id);
        let mut state = book.write().await;

        let mut tx = self.pool.begin().await?;

        let mut order = self.orders.get_by_id_for_update(&mut tx, req.order_id).await?;

        if !order.is_cancellable() {
            return Err(OrderServiceError::InvalidOrderStatus(order.status));
        }

        let now = Utc::now();
        order.status = OrderStatus::Cancelled;
        order.cancelled_at = Some(now);
        self.orders.update(&mut tx, &mut order).await?;

        let event = OutboxEvent::new(
            order.id,
            aggregate_type::ORDER,
            event_type::ORDER_CANCELLED,
            json!({
                "order_id": order.id.to_string(),
                "user_id": order.user_id.to_string(),
                "market_id": order.market_id,
                "selection_id": order.selection_id,
                "size_remaining": order.size_remaining.to_string(),
                "cancelled_at": now.to_rfc3339(),
            }),
            req.saga_id.or(order.saga_id),
        );
        self.outbox.create(&mut tx, &event).await?;

        self.idempotency
            .store_in_transaction(
                &mut tx,
                &req.idempotency_key,
                &request_hash,
                &serde_json::Value::Null,
                Self::idempotency_ttl(),
            )
            .await?;

        tx.commit().await?;

        if state.cancel(order.id).is_none() {
            // The row is the source of truth; the book may simply not hold
            // the order after a restart race.
            warn!(order_id = %order.id, "cancelled order was not in the book");
        }
        drop(state);

        self.metrics
            .orders_cancelled_total
            .with_label_values(&[&order.side.to_string()])
            .inc();
        self.metrics.active_orders.dec();

        info!(order_id = %order.id, "order cancelled");

        Ok(())
    }

    // ========================================================================
    // Settle
    // ========================================================================

    /// Settle a fully matched order with its result and payout
    pub async fn settle_order(&self, req: SettleOrderRequest) -> Result<(), OrderServiceError> {
        if req.idempotency_key.trim().is_empty() {
            return Err(OrderServiceError::Validation(
                "idempotency_key is required".into(),
            ));
        }
        if req.payout < Decimal::ZERO {
            return Err(OrderServiceError::Validation(
                "payout must not be negative".into(),
            ));
        }

        let request_hash = compute_request_hash(&req)?;

        if self
            .idempotency
            .check(&req.idempotency_key, &request_hash)
            .await?
            .is_some()
        {
            info!(
                order_id = %req.order_id,
                idempotency_key = %req.idempotency_key,
                "settlement already processed (idempotency)"
            );
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let mut order = self.orders.get_by_id_for_update(&mut tx, req.order_id).await?;

        if order.status != OrderStatus::Matched {
            return Err(OrderServiceError::InvalidOrderStatus(order.status));
        }

        let now = Utc::now();
        order.status = req.result.order_status();
        self.orders.update(&mut tx, &mut order).await?;

        self.matches
            .mark_settled_for_order(&mut tx, order.id, now)
            .await?;

        let event = OutboxEvent::new(
            order.id,
            aggregate_type::ORDER,
            event_type::ORDER_SETTLED,
            json!({
                "order_id": order.id.to_string(),
                "user_id": order.user_id.to_string(),
                "result": req.result.to_string(),
                "payout": req.payout.to_string(),
                "settled_at": now.to_rfc3339(),
            }),
            req.saga_id.or(order.saga_id),
        );
        self.outbox.create(&mut tx, &event).await?;

        self.idempotency
            .store_in_transaction(
                &mut tx,
                &req.idempotency_key,
                &request_hash,
                &serde_json::Value::Null,
                Self::idempotency_ttl(),
            )
            .await?;

        tx.commit().await?;

        self.metrics
            .orders_settled_total
            .with_label_values(&[&req.result.to_string()])
            .inc();
        if req.result == SettlementResult::Win {
            self.metrics
                .order_payout_total
                .inc_by(req.payout.to_f64().unwrap_or(0.0));
        }

        info!(
            order_id = %order.id,
            result = %req.result,
            payout = %req.payout,
            "order settled"
        );

        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_order_by_id(&self, order_id: Uuid) -> Result<Order, OrderServiceError> {
        Ok(self.orders.get_by_id(order_id).await?)
    }

    pub async fn get_order_matches(&self, order_id: Uuid) -> Result<Vec<Match>, OrderServiceError> {
        Ok(self.matches.get_by_order_id(order_id).await?)
    }

    /// The order a distributed workflow step created, if any
    pub async fn get_order_by_saga(&self, saga_id: Uuid) -> Result<Order, OrderServiceError> {
        Ok(self.orders.get_by_saga_id(saga_id).await?)
    }

    /// Resting orders on one side of a book, best price first
    pub async fn get_book_orders(
        &self,
        market_id: &str,
        selection_id: &str,
        side: OrderSide,
        status: OrderStatus,
        limit: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        let limit = Self::clamp_limit(limit);
        Ok(self
            .orders
            .get_by_market_and_selection(market_id, selection_id, side, status, limit)
            .await?)
    }

    pub async fn get_user_orders(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        let limit = Self::clamp_limit(limit);
        let offset = offset.max(0);
        Ok(self.orders.get_by_user_id(user_id, limit, offset).await?)
    }

    /// Live orders for a market, paginated
    pub async fn get_orders_by_market(
        &self,
        market_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        let limit = Self::clamp_limit(limit) as usize;
        let offset = offset.max(0) as usize;

        let orders = self.orders.get_pending_orders(market_id).await?;

        if offset >= orders.len() {
            return Ok(Vec::new());
        }
        let end = (offset + limit).min(orders.len());
        Ok(orders[offset..end].to_vec())
    }

    pub async fn get_active_orders(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        let limit = Self::clamp_limit(limit);
        let offset = offset.max(0);
        Ok(self.orders.get_active_orders(limit, offset).await?)
    }

    fn clamp_limit(limit: i64) -> i64 {
        if limit <= 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        }
    }

    // ========================================================================
    // Outbox payloads
    // ========================================================================

    fn placed_event(&self, order: &Order) -> OutboxEvent {
        OutboxEvent::new(
            order.id,
            aggregate_type::ORDER,
            event_type::ORDER_PLACED,
            json!({
                "order_id": order.id.to_string(),
                "user_id": order.user_id.to_string(),
                "market_id": order.market_id,
                "selection_id": order.selection_id,
                "side": order.side.to_string(),
                "odds": order.price.to_string(),
                "size": order.size.to_string(),
                "potential_payout": order.potential_payout().to_string(),
                "reservation_id": order.reservation_id.map(|id| id.to_string()),
                "placed_at": order.placed_at.to_rfc3339(),
            }),
            order.saga_id,
        )
    }

    fn match_created_event(&self, fill: &Fill, saga_id: Option<Uuid>) -> OutboxEvent {
        let m = &fill.match_record;
        OutboxEvent::new(
            m.id,
            aggregate_type::MATCH,
            event_type::MATCH_CREATED,
            json!({
                "match_id": m.id.to_string(),
                "market_id": m.market_id,
                "selection_id": m.selection_id,
                "back_order_id": m.back_order_id.to_string(),
                "lay_order_id": m.lay_order_id.to_string(),
                "back_user_id": m.back_user_id.to_string(),
                "lay_user_id": m.lay_user_id.to_string(),
                "price": m.price.to_string(),
                "size": m.size.to_string(),
                "back_liability": m.back_liability.to_string(),
                "lay_liability": m.lay_liability.to_string(),
                "matched_at": m.matched_at.to_rfc3339(),
            }),
            saga_id,
        )
    }

    /// Event for the resting order consumed by a fill
    fn maker_matched_event(&self, fill: &Fill, taker_side: OrderSide) -> OutboxEvent {
        let m = &fill.match_record;
        let maker_user_id = match taker_side {
            OrderSide::Back => m.lay_user_id,
            OrderSide::Lay => m.back_user_id,
        };
        let kind = if fill.maker.status == OrderStatus::Matched {
            event_type::ORDER_MATCHED
        } else {
            event_type::ORDER_PARTIALLY_MATCHED
        };

        OutboxEvent::new(
            fill.maker.order_id,
            aggregate_type::ORDER,
            kind,
            json!({
                "order_id": fill.maker.order_id.to_string(),
                "user_id": maker_user_id.to_string(),
                "match_id": m.id.to_string(),
                "matched_price": m.price.to_string(),
                "matched_size": m.size.to_string(),
                "size_matched": fill.maker.size_matched.to_string(),
                "size_remaining": fill.maker.size_remaining.to_string(),
                "status": fill.maker.status.to_string(),
                "matched_at": m.matched_at.to_rfc3339(),
            }),
            None,
        )
    }

    fn taker_matched_event(&self, order: &Order) -> OutboxEvent {
        let kind = if order.status == OrderStatus::Matched {
            event_type::ORDER_MATCHED
        } else {
            event_type::ORDER_PARTIALLY_MATCHED
        };

        OutboxEvent::new(
            order.id,
            aggregate_type::ORDER,
            kind,
            json!({
                "order_id": order.id.to_string(),
                "user_id": order.user_id.to_string(),
                "size_matched": order.size_matched.to_string(),
                "size_remaining": order.size_remaining.to_string(),
                "status": order.status.to_string(),
                "matched_at": order.matched_at.map(|t| t.to_rfc3339()),
            }),
            order.saga_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn place_request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            user_id: Uuid::new_v4(),
            market_id: "match-winner".to_string(),
            selection_id: "team-a".to_string(),
            bet_type: "BACK".to_string(),
            odds: dec!(2.5),
            amount: dec!(10),
            reservation_id: None,
            saga_id: None,
            idempotency_key: "key-1".to_string(),
        }
    }

    #[test]
    fn test_validate_place_request_ok() {
        let side = OrderService::validate_place_request(&place_request()).unwrap();
        assert_eq!(side, OrderSide::Back);
    }

    #[test]
    fn test_validate_rejects_zero_amount() {
        let req = PlaceOrderRequest {
            amount: dec!(0),
            ..place_request()
        };
        assert!(matches!(
            OrderService::validate_place_request(&req),
            Err(OrderServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_odds_at_or_below_one() {
        for odds in [dec!(1), dec!(0.5)] {
            let req = PlaceOrderRequest {
                odds,
                ..place_request()
            };
            assert!(matches!(
                OrderService::validate_place_request(&req),
                Err(OrderServiceError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_unknown_side() {
        let req = PlaceOrderRequest {
            bet_type: "HEDGE".to_string(),
            ..place_request()
        };
        assert!(matches!(
            OrderService::validate_place_request(&req),
            Err(OrderServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_idempotency_key() {
        let req = PlaceOrderRequest {
            idempotency_key: "  ".to_string(),
            ..place_request()
        };
        assert!(matches!(
            OrderService::validate_place_request(&req),
            Err(OrderServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(OrderService::clamp_limit(0), 50);
        assert_eq!(OrderService::clamp_limit(-5), 50);
        assert_eq!(OrderService::clamp_limit(30), 30);
        assert_eq!(OrderService::clamp_limit(250), 100);
    }
}
