//! Order service requests and errors

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::OrderStatus;
use crate::repository::RepositoryError;

/// Request to place a new bet order
///
/// Serialized canonically for the idempotency request hash, so field
/// changes are breaking for in-flight idempotency windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: Uuid,
    pub market_id: String,
    pub selection_id: String,
    /// "BACK" or "LAY", mapped to the order side
    pub bet_type: String,
    /// Decimal odds, must be > 1
    pub odds: Decimal,
    /// Stake, must be > 0
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    pub idempotency_key: String,
}

/// Request to cancel an active order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub order_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    pub idempotency_key: String,
}

/// Settlement outcome for a matched order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementResult {
    Win,
    Loss,
    Push,
}

impl SettlementResult {
    pub fn order_status(&self) -> OrderStatus {
        match self {
            SettlementResult::Win => OrderStatus::SettledWin,
            SettlementResult::Loss => OrderStatus::SettledLoss,
            SettlementResult::Push => OrderStatus::SettledPush,
        }
    }
}

impl fmt::Display for SettlementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementResult::Win => write!(f, "win"),
            SettlementResult::Loss => write!(f, "loss"),
            SettlementResult::Push => write!(f, "push"),
        }
    }
}

impl std::str::FromStr for SettlementResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "win" => Ok(SettlementResult::Win),
            "loss" => Ok(SettlementResult::Loss),
            "push" => Ok(SettlementResult::Push),
            _ => Err(format!("Invalid settlement result: {}", s)),
        }
    }
}

/// Request to settle a matched order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleOrderRequest {
    pub order_id: Uuid,
    pub result: SettlementResult,
    /// Actual payout, must be >= 0
    pub payout: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    pub idempotency_key: String,
}

/// Order service errors
#[derive(Debug, thiserror::Error)]
pub enum OrderServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid order status for operation: {0}")]
    InvalidOrderStatus(OrderStatus),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<serde_json::Error> for OrderServiceError {
    fn from(e: serde_json::Error) -> Self {
        OrderServiceError::Repository(RepositoryError::Serialization(e))
    }
}

impl From<sqlx::Error> for OrderServiceError {
    fn from(e: sqlx::Error) -> Self {
        OrderServiceError::Repository(RepositoryError::Database(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_settlement_result_parse() {
        assert_eq!("win".parse::<SettlementResult>().unwrap(), SettlementResult::Win);
        assert_eq!("LOSS".parse::<SettlementResult>().unwrap(), SettlementResult::Loss);
        assert_eq!("push".parse::<SettlementResult>().unwrap(), SettlementResult::Push);
        assert!("void".parse::<SettlementResult>().is_err());
    }

    #[test]
    fn test_settlement_result_status() {
        assert_eq!(SettlementResult::Win.order_status(), OrderStatus::SettledWin);
        assert_eq!(SettlementResult::Loss.order_status(), OrderStatus::SettledLoss);
        assert_eq!(SettlementResult::Push.order_status(), OrderStatus::SettledPush);
    }

    #[test]
    fn test_place_request_hash_is_stable() {
        let req = PlaceOrderRequest {
            user_id: Uuid::nil(),
            market_id: "match-winner".to_string(),
            selection_id: "team-a".to_string(),
            bet_type: "BACK".to_string(),
            odds: dec!(2.5),
            amount: dec!(10),
            reservation_id: None,
            saga_id: None,
            idempotency_key: "key-1".to_string(),
        };

        let h1 = crate::repository::compute_request_hash(&req).unwrap();
        let h2 = crate::repository::compute_request_hash(&req.clone()).unwrap();
        assert_eq!(h1, h2);

        let altered = PlaceOrderRequest {
            amount: dec!(11),
            ..req
        };
        assert_ne!(h1, crate::repository::compute_request_hash(&altered).unwrap());
    }
}
