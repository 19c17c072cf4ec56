//! Order and match models for the betting exchange.
//!
//! An order backs or lays a selection at decimal odds; a match records a
//! crossed trade between one BACK and one LAY order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Order side: for or against an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_side", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Betting for the outcome
    Back,
    /// Betting against the outcome
    Lay,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Back => OrderSide::Lay,
            OrderSide::Lay => OrderSide::Back,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Back => write!(f, "BACK"),
            OrderSide::Lay => write!(f, "LAY"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BACK" => Ok(OrderSide::Back),
            "LAY" => Ok(OrderSide::Lay),
            _ => Err(format!("Invalid order side: {}", s)),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Unmatched, resting in the book
    Pending,
    /// Partially matched, remainder resting in the book
    Partially,
    /// Fully matched
    Matched,
    /// Cancelled by user or system
    Cancelled,
    /// Market closed before a match
    Expired,
    /// Settled as a winning bet
    SettledWin,
    /// Settled as a losing bet
    SettledLoss,
    /// Settled as a void/push
    SettledPush,
}

impl OrderStatus {
    /// Orders still live in the book
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Partially)
    }

    /// Terminal states are never mutated further
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Expired) || self.is_settled()
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            OrderStatus::SettledWin | OrderStatus::SettledLoss | OrderStatus::SettledPush
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Partially => "PARTIALLY",
            OrderStatus::Matched => "MATCHED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::SettledWin => "SETTLED_WIN",
            OrderStatus::SettledLoss => "SETTLED_LOSS",
            OrderStatus::SettledPush => "SETTLED_PUSH",
        };
        write!(f, "{}", s)
    }
}

/// An order in the exchange
///
/// The aggregate root for the order lifecycle. Mutated only inside a
/// transaction holding a row lock or through the version check in the
/// repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    /// Order unique ID
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Market identifier (e.g. "match-winner")
    pub market_id: String,

    /// Selection within the market (e.g. "team-a")
    pub selection_id: String,

    /// BACK or LAY
    pub side: OrderSide,

    /// Decimal odds, strictly greater than 1
    pub price: Decimal,

    /// Stake amount
    pub size: Decimal,

    /// Amount matched so far
    pub size_matched: Decimal,

    /// Amount still to match; size_matched + size_remaining = size
    pub size_remaining: Decimal,

    pub status: OrderStatus,

    /// Wallet reservation correlation token
    pub reservation_id: Option<Uuid>,

    /// Distributed workflow correlation token
    pub saga_id: Option<Uuid>,

    /// Client-chosen key binding this request to a single durable effect
    pub idempotency_key: String,

    pub placed_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Optimistic locking counter, starts at 1
    pub version: i64,
}

impl Order {
    /// Gross return if the bet wins: stake x odds
    pub fn potential_payout(&self) -> Decimal {
        self.size * self.price
    }

    /// Whether the size/status invariants hold
    pub fn is_consistent(&self) -> bool {
        if self.size_matched + self.size_remaining != self.size {
            return false;
        }
        match self.status {
            OrderStatus::Matched => self.size_remaining.is_zero(),
            OrderStatus::Partially => {
                !self.size_matched.is_zero() && !self.size_remaining.is_zero()
            }
            OrderStatus::Pending => self.size_matched.is_zero(),
            _ => true,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        self.status.is_active()
    }
}

/// A matched trade between a BACK and a LAY order
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Match {
    pub id: Uuid,
    pub market_id: String,
    pub selection_id: String,
    pub back_order_id: Uuid,
    pub lay_order_id: Uuid,
    pub back_user_id: Uuid,
    pub lay_user_id: Uuid,

    /// Matched odds (the resting order's price)
    pub price: Decimal,

    /// Matched stake
    pub size: Decimal,

    /// Back bettor risks the stake
    pub back_liability: Decimal,

    /// Lay bettor risks size x (price - 1)
    pub lay_liability: Decimal,

    pub matched_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Match {
    /// Lay liability at given odds: size x (price - 1)
    pub fn lay_liability_for(price: Decimal, size: Decimal) -> Decimal {
        size * (price - Decimal::ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(size: Decimal, matched: Decimal, status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            market_id: "match-winner".to_string(),
            selection_id: "team-a".to_string(),
            side: OrderSide::Back,
            price: dec!(2.5),
            size,
            size_matched: matched,
            size_remaining: size - matched,
            status,
            reservation_id: None,
            saga_id: None,
            idempotency_key: "key-1".to_string(),
            placed_at: Utc::now(),
            matched_at: None,
            cancelled_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Back.opposite(), OrderSide::Lay);
        assert_eq!(OrderSide::Lay.opposite(), OrderSide::Back);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!("back".parse::<OrderSide>().unwrap(), OrderSide::Back);
        assert_eq!("LAY".parse::<OrderSide>().unwrap(), OrderSide::Lay);
        assert!("buy".parse::<OrderSide>().is_err());
    }

    #[test]
    fn test_status_is_active() {
        assert!(OrderStatus::Pending.is_active());
        assert!(OrderStatus::Partially.is_active());
        assert!(!OrderStatus::Matched.is_active());
        assert!(!OrderStatus::Cancelled.is_active());
        assert!(!OrderStatus::SettledWin.is_active());
    }

    #[test]
    fn test_status_terminal() {
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::SettledLoss.is_terminal());
        assert!(!OrderStatus::Matched.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn test_potential_payout() {
        let o = order(dec!(10), dec!(0), OrderStatus::Pending);
        assert_eq!(o.potential_payout(), dec!(25.0));
    }

    #[test]
    fn test_consistency() {
        assert!(order(dec!(10), dec!(0), OrderStatus::Pending).is_consistent());
        assert!(order(dec!(10), dec!(4), OrderStatus::Partially).is_consistent());
        assert!(order(dec!(10), dec!(10), OrderStatus::Matched).is_consistent());
        assert!(!order(dec!(10), dec!(10), OrderStatus::Pending).is_consistent());
        assert!(!order(dec!(10), dec!(0), OrderStatus::Matched).is_consistent());
    }

    #[test]
    fn test_lay_liability() {
        assert_eq!(Match::lay_liability_for(dec!(3.0), dec!(5)), dec!(10.0));
        assert_eq!(Match::lay_liability_for(dec!(2.0), dec!(10)), dec!(10.0));
    }
}
