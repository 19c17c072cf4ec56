//! Outbox publishing: producer abstraction and the relay worker

pub mod producer;
pub mod relay;

pub use producer::{MessageProducer, OutboundMessage, RedisStreamProducer};
pub use relay::OutboxRelay;
