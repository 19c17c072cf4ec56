//! Transactional outbox event model.
//!
//! Outbox events are written inside the same database transaction as the
//! aggregate mutation they describe, then drained to the event bus by the
//! relay worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Aggregate types referenced by outbox events
pub mod aggregate_type {
    pub const ORDER: &str = "order";
    pub const MATCH: &str = "match";
}

/// Outbound event types
pub mod event_type {
    pub const ORDER_PLACED: &str = "order.placed";
    pub const ORDER_MATCHED: &str = "order.matched";
    pub const ORDER_PARTIALLY_MATCHED: &str = "order.partially_matched";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const ORDER_EXPIRED: &str = "order.expired";
    pub const ORDER_SETTLED: &str = "order.settled";
    pub const MATCH_CREATED: &str = "match.created";
    pub const MATCH_SETTLED: &str = "match.settled";
}

/// Default number of publish attempts before an event is parked for
/// out-of-band inspection.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// An event awaiting (or after) publication to the event bus
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_payload: serde_json::Value,
    pub saga_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Build a new unprocessed event for an aggregate mutation
    pub fn new(
        aggregate_id: Uuid,
        aggregate_type: &str,
        event_type: &str,
        event_payload: serde_json::Value,
        saga_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: event_type.to_string(),
            event_payload,
            saga_id,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_defaults() {
        let event = OutboxEvent::new(
            Uuid::new_v4(),
            aggregate_type::ORDER,
            event_type::ORDER_PLACED,
            serde_json::json!({"order_id": "abc"}),
            None,
        );

        assert!(!event.is_processed());
        assert!(event.can_retry());
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_can_retry_exhausted() {
        let mut event = OutboxEvent::new(
            Uuid::new_v4(),
            aggregate_type::ORDER,
            event_type::ORDER_CANCELLED,
            serde_json::json!({}),
            None,
        );
        event.retry_count = event.max_retries;
        assert!(!event.can_retry());
    }
}
