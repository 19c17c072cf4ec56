//! Outbox repository
//!
//! Event rows are inserted in the caller's transaction so a state change and
//! its events commit or roll back together. The relay drains them through
//! the `OutboxStore` trait.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::OutboxEvent;
use crate::observability::Metrics;

use super::{timed, RepositoryError};

/// Column width for last_error; longer messages are truncated
const LAST_ERROR_MAX_LEN: usize = 1024;

const EVENT_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, event_payload, \
     saga_id, created_at, processed_at, retry_count, max_retries, last_error";

/// Drain-side contract consumed by the outbox relay
pub trait OutboxStore: Send + Sync {
    fn get_unprocessed_events(
        &self,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<OutboxEvent>, RepositoryError>> + Send;

    fn mark_processed(
        &self,
        event_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn increment_retry_count(
        &self,
        event_id: Uuid,
        error_msg: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
    metrics: Arc<Metrics>,
}

impl OutboxRepository {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }

    /// Insert an event in the caller's transaction
    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), RepositoryError> {
        timed(&self.metrics, "create_outbox_event", async {
            sqlx::query(
                r#"
                INSERT INTO outbox_events (
                    id, aggregate_id, aggregate_type, event_type, event_payload,
                    saga_id, created_at, retry_count, max_retries
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(&event.event_payload)
            .bind(event.saga_id)
            .bind(event.created_at)
            .bind(event.retry_count)
            .bind(event.max_retries)
            .execute(&mut **tx)
            .await
        })
        .await?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            "outbox event created"
        );

        Ok(())
    }

    /// Delete processed events strictly older than the retention window.
    /// Safe to run concurrently with the relay, which only touches rows with
    /// processed_at IS NULL.
    pub async fn cleanup_processed_events(
        &self,
        older_than: Duration,
    ) -> Result<u64, RepositoryError> {
        let cutoff = Utc::now() - older_than;

        let result = timed(&self.metrics, "cleanup_outbox", async {
            sqlx::query(
                "DELETE FROM outbox_events WHERE processed_at IS NOT NULL AND processed_at < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
        })
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up processed outbox events");
        }

        Ok(deleted)
    }
}

impl OutboxStore for OutboxRepository {
    /// Unprocessed events that have retries left, oldest first
    async fn get_unprocessed_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, RepositoryError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE processed_at IS NULL AND retry_count < max_retries \
             ORDER BY created_at ASC \
             LIMIT $1"
        );

        let events = timed(&self.metrics, "get_unprocessed_events", async {
            sqlx::query_as::<_, OutboxEvent>(&query)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        })
        .await?;

        if !events.is_empty() {
            tracing::debug!(count = events.len(), "retrieved unprocessed events");
        }

        Ok(events)
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<(), RepositoryError> {
        let result = timed(&self.metrics, "mark_event_processed", async {
            sqlx::query(
                "UPDATE outbox_events SET processed_at = NOW() WHERE id = $1 AND processed_at IS NULL",
            )
            .bind(event_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(event_id = %event_id, "event not found or already processed");
            return Err(RepositoryError::EventNotFound(event_id));
        }

        tracing::debug!(event_id = %event_id, "event marked as processed");
        Ok(())
    }

    async fn increment_retry_count(
        &self,
        event_id: Uuid,
        error_msg: &str,
    ) -> Result<(), RepositoryError> {
        let truncated: String = error_msg.chars().take(LAST_ERROR_MAX_LEN).collect();

        let result = timed(&self.metrics, "increment_event_retry", async {
            sqlx::query(
                "UPDATE outbox_events SET retry_count = retry_count + 1, last_error = $2 WHERE id = $1",
            )
            .bind(event_id)
            .bind(&truncated)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(event_id = %event_id, "event not found");
            return Err(RepositoryError::EventNotFound(event_id));
        }

        tracing::debug!(event_id = %event_id, "retry count incremented");
        Ok(())
    }
}
