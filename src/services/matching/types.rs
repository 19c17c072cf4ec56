//! Matching engine types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Match, Order, OrderSide, OrderStatus};

/// A live order resting in a price level
///
/// Carries the fields the book needs for matching plus the version the
/// repository uses for its optimistic write predicate. The in-memory version
/// is kept in lockstep with the row version.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub size_matched: Decimal,
    pub size_remaining: Decimal,
    pub placed_at: DateTime<Utc>,
    pub version: i64,
}

impl From<&Order> for BookOrder {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            side: order.side,
            price: order.price,
            size: order.size,
            size_matched: order.size_matched,
            size_remaining: order.size_remaining,
            placed_at: order.placed_at,
            version: order.version,
        }
    }
}

/// Versioned state the resting (maker) order moves to when a fill commits
#[derive(Debug, Clone)]
pub struct MakerUpdate {
    pub order_id: Uuid,
    pub size_matched: Decimal,
    pub size_remaining: Decimal,
    pub status: OrderStatus,
    /// Version expected by the optimistic write predicate
    pub version: i64,
}

/// One pairing produced by the matching walk
#[derive(Debug, Clone)]
pub struct Fill {
    pub match_record: Match,
    pub maker: MakerUpdate,
}

/// The outcome of planning a placement against the book.
///
/// Planning never mutates the book; the plan is applied only after the
/// surrounding transaction commits.
#[derive(Debug, Clone)]
pub struct PlacementPlan {
    pub fills: Vec<Fill>,
    pub taker_size_matched: Decimal,
    pub taker_size_remaining: Decimal,
    pub taker_status: OrderStatus,
}

impl PlacementPlan {
    pub fn is_fully_matched(&self) -> bool {
        self.taker_size_remaining.is_zero()
    }

    pub fn has_fills(&self) -> bool {
        !self.fills.is_empty()
    }
}

/// Aggregated orders at one price
#[derive(Debug, Clone, Serialize)]
pub struct LevelSnapshot {
    pub price: Decimal,
    pub total_size: Decimal,
    pub order_count: usize,
}

/// Aggregated ladders for one (market, selection) book
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub market_id: String,
    pub selection_id: String,
    /// Sorted by price descending (best back first)
    pub back_levels: Vec<LevelSnapshot>,
    /// Sorted by price ascending (best lay first)
    pub lay_levels: Vec<LevelSnapshot>,
    pub updated_at: DateTime<Utc>,
}
