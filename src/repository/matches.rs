//! Match repository
//!
//! Match rows are written in the same transaction as the order mutations
//! that produced them and are immutable afterwards, except for settled_at.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::Match;
use crate::observability::Metrics;

use super::{timed, RepositoryError};

const MATCH_COLUMNS: &str = "id, market_id, selection_id, back_order_id, lay_order_id, \
     back_user_id, lay_user_id, price, size, back_liability, lay_liability, \
     matched_at, settled_at";

#[derive(Clone)]
pub struct MatchRepository {
    pool: PgPool,
    metrics: Arc<Metrics>,
}

impl MatchRepository {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }

    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        m: &Match,
    ) -> Result<(), RepositoryError> {
        timed(&self.metrics, "create_match", async {
            sqlx::query(
                r#"
                INSERT INTO matches (
                    id, market_id, selection_id, back_order_id, lay_order_id,
                    back_user_id, lay_user_id, price, size, back_liability,
                    lay_liability, matched_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(m.id)
            .bind(&m.market_id)
            .bind(&m.selection_id)
            .bind(m.back_order_id)
            .bind(m.lay_order_id)
            .bind(m.back_user_id)
            .bind(m.lay_user_id)
            .bind(m.price)
            .bind(m.size)
            .bind(m.back_liability)
            .bind(m.lay_liability)
            .bind(m.matched_at)
            .execute(&mut **tx)
            .await
        })
        .await?;

        tracing::debug!(
            match_id = %m.id,
            back_order_id = %m.back_order_id,
            lay_order_id = %m.lay_order_id,
            price = %m.price,
            size = %m.size,
            "match created"
        );

        Ok(())
    }

    /// All matches an order participated in, oldest first
    pub async fn get_by_order_id(&self, order_id: Uuid) -> Result<Vec<Match>, RepositoryError> {
        let query = format!(
            "SELECT {MATCH_COLUMNS} FROM matches \
             WHERE back_order_id = $1 OR lay_order_id = $1 \
             ORDER BY matched_at ASC, id ASC"
        );

        Ok(timed(&self.metrics, "get_matches_by_order", async {
            sqlx::query_as::<_, Match>(&query)
                .bind(order_id)
                .fetch_all(&self.pool)
                .await
        })
        .await?)
    }

    /// Stamp settled_at on every match an order participated in. Already
    /// settled matches are left untouched.
    pub async fn mark_settled_for_order(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
        settled_at: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = timed(&self.metrics, "mark_matches_settled", async {
            sqlx::query(
                r#"
                UPDATE matches
                SET settled_at = $1
                WHERE (back_order_id = $2 OR lay_order_id = $2) AND settled_at IS NULL
                "#,
            )
            .bind(settled_at)
            .bind(order_id)
            .execute(&mut **tx)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }
}
