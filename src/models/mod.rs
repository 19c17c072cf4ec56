//! Domain models

pub mod order;
pub mod outbox;

pub use order::{Match, Order, OrderSide, OrderStatus};
pub use outbox::OutboxEvent;
