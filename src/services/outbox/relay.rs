//! Outbox relay
//!
//! Background worker draining the outbox table to the event bus. Delivery is
//! at-least-once: an event is marked processed only after a successful send,
//! and a failed send only increments its retry count. Events that exhaust
//! max_retries stop being fetched and stay visible for inspection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::observability::Metrics;
use crate::repository::OutboxStore;

use super::producer::{MessageProducer, OutboundMessage};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_BATCH_SIZE: i64 = 100;

pub struct OutboxRelay<S, P> {
    store: S,
    producer: P,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    batch_size: i64,
}

impl<S: OutboxStore, P: MessageProducer> OutboxRelay<S, P> {
    pub fn new(store: S, producer: P, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            producer,
            metrics,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Poll until shutdown flips. An in-flight drain finishes before exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox relay started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox relay stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One drain cycle: fetch a batch oldest-first and publish each event,
    /// recording the outcome per event. Returns the number published.
    pub async fn drain_once(&self) -> usize {
        let events = match self.store.get_unprocessed_events(self.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to fetch unprocessed events");
                self.metrics.outbox_poll_errors.inc();
                return 0;
            }
        };

        if events.is_empty() {
            return 0;
        }

        let mut published = 0usize;

        for event in &events {
            let message = match OutboundMessage::from_event(event) {
                Ok(message) => message,
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "failed to encode event payload");
                    self.record_failure(event.id, &event.event_type, &e.to_string())
                        .await;
                    continue;
                }
            };

            match self.producer.send(&message).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_processed(event.id).await {
                        error!(event_id = %event.id, error = %e, "failed to mark event as processed");
                        continue;
                    }
                    self.metrics
                        .outbox_events_published
                        .with_label_values(&[event.event_type.as_str()])
                        .inc();
                    published += 1;
                    debug!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        topic = %message.topic,
                        "event published"
                    );
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "failed to publish event"
                    );
                    self.record_failure(event.id, &event.event_type, &e.to_string())
                        .await;
                }
            }
        }

        published
    }

    async fn record_failure(&self, event_id: uuid::Uuid, kind: &str, error_msg: &str) {
        if let Err(e) = self.store.increment_retry_count(event_id, error_msg).await {
            error!(event_id = %event_id, error = %e, "failed to increment retry count");
        }
        self.metrics
            .outbox_events_failed
            .with_label_values(&[kind])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::outbox::{aggregate_type, event_type};
    use crate::models::OutboxEvent;
    use crate::repository::RepositoryError;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// In-memory outbox with the same drain semantics as the table
    #[derive(Default)]
    struct MemoryStore {
        events: Mutex<Vec<OutboxEvent>>,
    }

    impl MemoryStore {
        fn push(&self, event: OutboxEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn get(&self, id: Uuid) -> OutboxEvent {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .unwrap()
        }
    }

    impl OutboxStore for &MemoryStore {
        async fn get_unprocessed_events(
            &self,
            limit: i64,
        ) -> Result<Vec<OutboxEvent>, RepositoryError> {
            let mut events: Vec<OutboxEvent> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.processed_at.is_none() && e.retry_count < e.max_retries)
                .cloned()
                .collect();
            events.sort_by_key(|e| e.created_at);
            events.truncate(limit as usize);
            Ok(events)
        }

        async fn mark_processed(&self, event_id: Uuid) -> Result<(), RepositoryError> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .iter_mut()
                .find(|e| e.id == event_id)
                .ok_or(RepositoryError::EventNotFound(event_id))?;
            event.processed_at = Some(Utc::now());
            Ok(())
        }

        async fn increment_retry_count(
            &self,
            event_id: Uuid,
            error_msg: &str,
        ) -> Result<(), RepositoryError> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .iter_mut()
                .find(|e| e.id == event_id)
                .ok_or(RepositoryError::EventNotFound(event_id))?;
            event.retry_count += 1;
            event.last_error = Some(error_msg.to_string());
            Ok(())
        }
    }

    /// Producer that records messages and can be told to fail
    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: Mutex<bool>,
    }

    impl RecordingProducer {
        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl MessageProducer for &RecordingProducer {
        async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("broker unavailable");
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn placed_event() -> OutboxEvent {
        OutboxEvent::new(
            Uuid::new_v4(),
            aggregate_type::ORDER,
            event_type::ORDER_PLACED,
            serde_json::json!({"size": "10"}),
            None,
        )
    }

    #[tokio::test]
    async fn test_drain_publishes_and_marks_processed() {
        let store = MemoryStore::default();
        let producer = RecordingProducer::default();
        let event = placed_event();
        let event_id = event.id;
        let aggregate_id = event.aggregate_id;
        store.push(event);

        let relay = OutboxRelay::new(&store, &producer, Arc::new(Metrics::new()));
        let published = relay.drain_once().await;

        assert_eq!(published, 1);
        assert!(store.get(event_id).processed_at.is_some());

        let sent = producer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "order.events");
        assert_eq!(sent[0].key, aggregate_id.to_string());
    }

    #[tokio::test]
    async fn test_failed_publish_increments_retry_and_stays_unprocessed() {
        let store = MemoryStore::default();
        let producer = RecordingProducer::default();
        producer.set_fail(true);
        let event = placed_event();
        let event_id = event.id;
        store.push(event);

        let relay = OutboxRelay::new(&store, &producer, Arc::new(Metrics::new()));
        let published = relay.drain_once().await;

        assert_eq!(published, 0);
        let stored = store.get(event_id);
        assert!(stored.processed_at.is_none());
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("broker unavailable"));
    }

    #[tokio::test]
    async fn test_poisoned_events_stop_being_fetched() {
        let store = MemoryStore::default();
        let producer = RecordingProducer::default();
        producer.set_fail(true);
        let event = placed_event();
        let event_id = event.id;
        let max_retries = event.max_retries;
        store.push(event);

        let relay = OutboxRelay::new(&store, &producer, Arc::new(Metrics::new()));

        for _ in 0..max_retries {
            relay.drain_once().await;
        }
        assert_eq!(store.get(event_id).retry_count, max_retries);

        // Retries exhausted: the event is no longer offered, even though a
        // working producer is back.
        producer.set_fail(false);
        let published = relay.drain_once().await;
        assert_eq!(published, 0);
        assert!(store.get(event_id).processed_at.is_none());
    }

    #[tokio::test]
    async fn test_drain_preserves_oldest_first_order() {
        let store = MemoryStore::default();
        let producer = RecordingProducer::default();

        let mut first = placed_event();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = placed_event();
        second.created_at = Utc::now() - chrono::Duration::seconds(5);
        let first_key = first.aggregate_id.to_string();
        let second_key = second.aggregate_id.to_string();
        // Insert newest first to prove ordering comes from created_at
        store.push(second);
        store.push(first);

        let relay = OutboxRelay::new(&store, &producer, Arc::new(Metrics::new()));
        relay.drain_once().await;

        let sent = producer.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key, first_key);
        assert_eq!(sent[1].key, second_key);
    }

    #[tokio::test]
    async fn test_one_bad_event_does_not_block_the_batch() {
        let store = MemoryStore::default();
        let producer = RecordingProducer::default();

        let mut settled = OutboxEvent::new(
            Uuid::new_v4(),
            aggregate_type::ORDER,
            event_type::ORDER_SETTLED,
            serde_json::json!({"result": "win"}),
            None,
        );
        settled.created_at = Utc::now() + chrono::Duration::seconds(1);
        let settled_id = settled.id;
        let placed = placed_event();
        let placed_id = placed.id;

        store.push(placed);
        store.push(settled);

        // Fail the whole first cycle, then recover: both events retain
        // independent accounting.
        producer.set_fail(true);
        let relay = OutboxRelay::new(&store, &producer, Arc::new(Metrics::new()));
        relay.drain_once().await;
        assert_eq!(store.get(placed_id).retry_count, 1);
        assert_eq!(store.get(settled_id).retry_count, 1);

        producer.set_fail(false);
        let published = relay.drain_once().await;
        assert_eq!(published, 2);
        assert!(store.get(placed_id).processed_at.is_some());
        assert!(store.get(settled_id).processed_at.is_some());

        let sent = producer.sent.lock().unwrap();
        assert_eq!(sent[1].topic, "order.settlements");
    }
}
