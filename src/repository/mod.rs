//! Persistence layer
//!
//! Repositories over PostgreSQL. Write operations take a caller-supplied
//! transaction so aggregate mutations, outbox events and idempotency records
//! commit or roll back together.

pub mod idempotency;
pub mod matches;
pub mod orders;
pub mod outbox;

pub use idempotency::{compute_request_hash, IdempotencyRepository};
pub use matches::MatchRepository;
pub use orders::OrderRepository;
pub use outbox::{OutboxRepository, OutboxStore};

/// Errors surfaced by the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("order not found")]
    OrderNotFound,

    #[error("optimistic lock failure: version mismatch")]
    OptimisticLock,

    #[error("idempotency key exists with different request hash")]
    IdempotencyMismatch,

    #[error("duplicate idempotency key")]
    DuplicateIdempotencyKey,

    #[error("outbox event not found: {0}")]
    EventNotFound(uuid::Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Postgres unique_violation SQLSTATE
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

/// Run one database operation, recording its duration and, on failure, its
/// error counter under the given operation label.
pub(crate) async fn timed<T, F>(
    metrics: &crate::observability::Metrics,
    operation: &str,
    fut: F,
) -> Result<T, sqlx::Error>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let started = std::time::Instant::now();
    let result = fut.await;

    metrics
        .database_operation_duration
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());

    if result.is_err() {
        metrics
            .database_errors
            .with_label_values(&[operation])
            .inc();
    }

    result
}
