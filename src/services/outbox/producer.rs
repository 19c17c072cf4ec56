//! Event bus producer
//!
//! The bus is consumed through a single send-one-message primitive so the
//! relay stays agnostic of the transport. The production implementation
//! appends to Redis Streams; messages are keyed by aggregate id so consumers
//! that preserve per-key order see per-aggregate order.

use std::future::Future;

use crate::models::outbox::event_type;
use crate::models::OutboxEvent;

/// Default destination for event types without an explicit route
pub const DEFAULT_TOPIC: &str = "order.events";

/// Settlement events get their own stream
pub const SETTLEMENTS_TOPIC: &str = "order.settlements";

/// Map an event type to its destination topic
pub fn topic_for(kind: &str) -> &'static str {
    match kind {
        event_type::ORDER_PLACED | event_type::ORDER_MATCHED | event_type::ORDER_CANCELLED => {
            DEFAULT_TOPIC
        }
        event_type::ORDER_SETTLED => SETTLEMENTS_TOPIC,
        _ => DEFAULT_TOPIC,
    }
}

/// A single message bound for the event bus
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Aggregate id; the per-key ordering handle on the bus
    pub key: String,
    /// JSON-encoded event payload
    pub payload: String,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn from_event(event: &OutboxEvent) -> Result<Self, serde_json::Error> {
        let mut headers = vec![
            ("event_type".to_string(), event.event_type.clone()),
            ("aggregate_type".to_string(), event.aggregate_type.clone()),
        ];
        if let Some(saga_id) = event.saga_id {
            headers.push(("saga_id".to_string(), saga_id.to_string()));
        }

        Ok(Self {
            topic: topic_for(&event.event_type).to_string(),
            key: event.aggregate_id.to_string(),
            payload: serde_json::to_string(&event.event_payload)?,
            headers,
        })
    }
}

/// Send-one-message primitive over the event bus
pub trait MessageProducer: Send + Sync {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Redis Streams producer
///
/// One XADD per message; the stream name is the topic. The connection
/// manager reconnects on its own, so a send error here is a transient
/// publish failure for the relay's retry accounting.
#[derive(Clone)]
pub struct RedisStreamProducer {
    conn: redis::aio::ConnectionManager,
}

impl RedisStreamProducer {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!(redis_url, "event bus producer connected");
        Ok(Self { conn })
    }
}

impl MessageProducer for RedisStreamProducer {
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&message.topic).arg("*").arg("key").arg(&message.key);

        for (name, value) in &message.headers {
            cmd.arg(name).arg(value);
        }
        cmd.arg("payload").arg(&message.payload);

        let mut conn = self.conn.clone();
        let entry_id: String = cmd.query_async(&mut conn).await?;

        tracing::debug!(
            topic = %message.topic,
            key = %message.key,
            entry_id = %entry_id,
            "published event to stream"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::outbox::aggregate_type;
    use uuid::Uuid;

    #[test]
    fn test_topic_routing() {
        assert_eq!(topic_for(event_type::ORDER_PLACED), "order.events");
        assert_eq!(topic_for(event_type::ORDER_MATCHED), "order.events");
        assert_eq!(topic_for(event_type::ORDER_CANCELLED), "order.events");
        assert_eq!(topic_for(event_type::ORDER_SETTLED), "order.settlements");
        // Unknown types land on the default topic
        assert_eq!(topic_for(event_type::MATCH_CREATED), "order.events");
        assert_eq!(topic_for("order.unknown"), "order.events");
    }

    #[test]
    fn test_message_from_event() {
        let aggregate_id = Uuid::new_v4();
        let saga_id = Uuid::new_v4();
        let event = OutboxEvent::new(
            aggregate_id,
            aggregate_type::ORDER,
            event_type::ORDER_SETTLED,
            serde_json::json!({"result": "win"}),
            Some(saga_id),
        );

        let message = OutboundMessage::from_event(&event).unwrap();

        assert_eq!(message.topic, "order.settlements");
        assert_eq!(message.key, aggregate_id.to_string());
        assert!(message.payload.contains("win"));
        assert!(message
            .headers
            .contains(&("event_type".to_string(), "order.settled".to_string())));
        assert!(message
            .headers
            .contains(&("aggregate_type".to_string(), "order".to_string())));
        assert!(message
            .headers
            .contains(&("saga_id".to_string(), saga_id.to_string())));
    }

    #[test]
    fn test_message_without_saga_has_no_saga_header() {
        let event = OutboxEvent::new(
            Uuid::new_v4(),
            aggregate_type::ORDER,
            event_type::ORDER_PLACED,
            serde_json::json!({}),
            None,
        );

        let message = OutboundMessage::from_event(&event).unwrap();
        assert!(!message.headers.iter().any(|(name, _)| name == "saga_id"));
    }
}
