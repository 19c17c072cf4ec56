//! Order repository
//!
//! Durable storage for the order aggregate. Mutations run inside a caller
//! transaction and guard against concurrent writers with a version column;
//! zero rows affected on a versioned update means another writer won.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Order, OrderSide, OrderStatus};
use crate::observability::Metrics;

use super::{timed, RepositoryError, UNIQUE_VIOLATION};

const ORDER_COLUMNS: &str = "id, user_id, market_id, selection_id, side, price, size, \
     size_matched, size_remaining, status, reservation_id, saga_id, \
     idempotency_key, placed_at, matched_at, cancelled_at, version";

#[derive(Clone)]
pub struct OrderRepository {
    pool: PgPool,
    metrics: Arc<Metrics>,
}

impl OrderRepository {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }

    /// Insert a new order. A unique-constraint hit on the idempotency key
    /// surfaces as `DuplicateIdempotencyKey`.
    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<(), RepositoryError> {
        let result = timed(&self.metrics, "create_order", async {
            sqlx::query(
                r#"
                INSERT INTO orders (
                    id, user_id, market_id, selection_id, side, price, size,
                    size_matched, size_remaining, status, reservation_id, saga_id,
                    idempotency_key, placed_at, matched_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(order.id)
            .bind(order.user_id)
            .bind(&order.market_id)
            .bind(&order.selection_id)
            .bind(order.side)
            .bind(order.price)
            .bind(order.size)
            .bind(order.size_matched)
            .bind(order.size_remaining)
            .bind(order.status)
            .bind(order.reservation_id)
            .bind(order.saga_id)
            .bind(&order.idempotency_key)
            .bind(order.placed_at)
            .bind(order.matched_at)
            .bind(order.version)
            .execute(&mut **tx)
            .await
        })
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    market_id = %order.market_id,
                    side = %order.side,
                    price = %order.price,
                    size = %order.size,
                    "order created"
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                tracing::debug!(
                    idempotency_key = %order.idempotency_key,
                    "order with idempotency key already exists"
                );
                Err(RepositoryError::DuplicateIdempotencyKey)
            }
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "failed to create order");
                Err(e.into())
            }
        }
    }

    /// Read an order under a row lock (SELECT ... FOR UPDATE)
    pub async fn get_by_id_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Order, RepositoryError> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");

        timed(&self.metrics, "get_order_for_update", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
        })
        .await?
        .ok_or(RepositoryError::OrderNotFound)
    }

    /// Versioned update of the mutable order fields. Increments the version
    /// on disk and in memory on success.
    pub async fn update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &mut Order,
    ) -> Result<(), RepositoryError> {
        let result = timed(&self.metrics, "update_order", async {
            sqlx::query(
                r#"
                UPDATE orders
                SET size_matched = $1, size_remaining = $2, status = $3,
                    matched_at = $4, cancelled_at = $5, version = version + 1
                WHERE id = $6 AND version = $7
                "#,
            )
            .bind(order.size_matched)
            .bind(order.size_remaining)
            .bind(order.status)
            .bind(order.matched_at)
            .bind(order.cancelled_at)
            .bind(order.id)
            .bind(order.version)
            .execute(&mut **tx)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                order_id = %order.id,
                version = order.version,
                "optimistic lock failure on order update"
            );
            return Err(RepositoryError::OptimisticLock);
        }

        order.version += 1;

        tracing::debug!(
            order_id = %order.id,
            status = %order.status,
            version = order.version,
            "order updated"
        );

        Ok(())
    }

    /// Versioned update of the matched amounts. matched_at is stamped when
    /// the order transitions into MATCHED or PARTIALLY.
    pub async fn update_matched(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        size_matched: Decimal,
        size_remaining: Decimal,
        status: OrderStatus,
        version: i64,
    ) -> Result<(), RepositoryError> {
        let result = timed(&self.metrics, "update_order_matched", async {
            sqlx::query(
                r#"
                UPDATE orders
                SET size_matched = $1, size_remaining = $2, status = $3,
                    matched_at = CASE WHEN $3 IN ($4, $5) THEN NOW() ELSE matched_at END,
                    version = version + 1
                WHERE id = $6 AND version = $7
                "#,
            )
            .bind(size_matched)
            .bind(size_remaining)
            .bind(status)
            .bind(OrderStatus::Matched)
            .bind(OrderStatus::Partially)
            .bind(id)
            .bind(version)
            .execute(&mut **tx)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                order_id = %id,
                version,
                "optimistic lock failure on matched update"
            );
            return Err(RepositoryError::OptimisticLock);
        }

        tracing::debug!(
            order_id = %id,
            size_matched = %size_matched,
            size_remaining = %size_remaining,
            status = %status,
            "order matched amounts updated"
        );

        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Order, RepositoryError> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");

        timed(&self.metrics, "get_order", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?
        .ok_or(RepositoryError::OrderNotFound)
    }

    pub async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, RepositoryError> {
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 ORDER BY placed_at DESC LIMIT $2 OFFSET $3"
        );

        Ok(timed(&self.metrics, "get_orders_by_user", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
        })
        .await?)
    }

    pub async fn get_by_saga_id(&self, saga_id: Uuid) -> Result<Order, RepositoryError> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE saga_id = $1");

        timed(&self.metrics, "get_order_by_saga", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(saga_id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?
        .ok_or(RepositoryError::OrderNotFound)
    }

    /// Orders for one side of a book at a given status, best price first
    /// (BACK descending, LAY ascending), then time priority.
    pub async fn get_by_market_and_selection(
        &self,
        market_id: &str,
        selection_id: &str,
        side: OrderSide,
        status: OrderStatus,
        limit: i64,
    ) -> Result<Vec<Order>, RepositoryError> {
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE market_id = $1 AND selection_id = $2 AND side = $3 AND status = $4 \
             ORDER BY \
                 CASE WHEN side = $5 THEN price END DESC, \
                 CASE WHEN side = $6 THEN price END ASC, \
                 placed_at ASC, id ASC \
             LIMIT $7"
        );

        Ok(timed(&self.metrics, "get_orders_by_book_side", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(market_id)
                .bind(selection_id)
                .bind(side)
                .bind(status)
                .bind(OrderSide::Back)
                .bind(OrderSide::Lay)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        })
        .await?)
    }

    /// Live orders for a market in placed_at order (id tiebreak), the order
    /// the book is rebuilt in on startup so time priority is preserved.
    pub async fn get_pending_orders(&self, market_id: &str) -> Result<Vec<Order>, RepositoryError> {
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE market_id = $1 AND status IN ($2, $3) \
             ORDER BY placed_at ASC, id ASC"
        );

        Ok(timed(&self.metrics, "get_pending_orders", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(market_id)
                .bind(OrderStatus::Pending)
                .bind(OrderStatus::Partially)
                .fetch_all(&self.pool)
                .await
        })
        .await?)
    }

    /// All live orders across markets, newest first
    pub async fn get_active_orders(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, RepositoryError> {
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status IN ($1, $2) \
             ORDER BY placed_at DESC LIMIT $3 OFFSET $4"
        );

        Ok(timed(&self.metrics, "get_active_orders", async {
            sqlx::query_as::<_, Order>(&query)
                .bind(OrderStatus::Pending)
                .bind(OrderStatus::Partially)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
        })
        .await?)
    }

    /// Distinct (market, selection) pairs with live orders, for startup
    /// book reconstruction.
    pub async fn get_active_books(&self) -> Result<Vec<(String, String)>, RepositoryError> {
        let rows: Vec<(String, String)> = timed(&self.metrics, "get_active_books", async {
            sqlx::query_as(
                r#"
                SELECT DISTINCT market_id, selection_id
                FROM orders
                WHERE status IN ($1, $2)
                "#,
            )
            .bind(OrderStatus::Pending)
            .bind(OrderStatus::Partially)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        Ok(rows)
    }
}
