//! HTTP handlers: a thin adapter mapping routes to order service operations

pub mod book;
pub mod health;
pub mod orders;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::repository::RepositoryError;
use crate::services::orders::OrderServiceError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, error: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

/// Map service errors onto the wire contract: caller errors are 4xx,
/// concurrency losses are retryable conflicts, everything else is opaque.
pub fn map_service_error(e: OrderServiceError) -> ApiError {
    match &e {
        OrderServiceError::Validation(msg) => {
            error_response(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg.clone())
        }
        OrderServiceError::InvalidOrderStatus(status) => error_response(
            StatusCode::CONFLICT,
            "INVALID_ORDER_STATUS",
            format!("order status {} does not allow this operation", status),
        ),
        OrderServiceError::Repository(RepositoryError::OrderNotFound) => {
            error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "order not found".into())
        }
        OrderServiceError::Repository(RepositoryError::IdempotencyMismatch) => error_response(
            StatusCode::CONFLICT,
            "IDEMPOTENCY_MISMATCH",
            "idempotency key already used with a different request".into(),
        ),
        OrderServiceError::Repository(RepositoryError::DuplicateIdempotencyKey) => error_response(
            StatusCode::CONFLICT,
            "IDEMPOTENCY_MISMATCH",
            "idempotency key already used".into(),
        ),
        OrderServiceError::Repository(RepositoryError::OptimisticLock) => error_response(
            StatusCode::CONFLICT,
            "ABORTED",
            "concurrent update, retry the request".into(),
        ),
        _ => {
            tracing::error!(error = %e, "internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal server error".into(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;

    #[test]
    fn test_error_mapping() {
        let (status, _) = map_service_error(OrderServiceError::Validation("bad".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = map_service_error(OrderServiceError::Repository(
            RepositoryError::OrderNotFound,
        ));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = map_service_error(OrderServiceError::Repository(
            RepositoryError::IdempotencyMismatch,
        ));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0.code, "IDEMPOTENCY_MISMATCH");

        let (status, body) = map_service_error(OrderServiceError::Repository(
            RepositoryError::OptimisticLock,
        ));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0.code, "ABORTED");

        let (status, _) =
            map_service_error(OrderServiceError::InvalidOrderStatus(OrderStatus::Matched));
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
