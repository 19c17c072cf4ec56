//! Postgres pool setup
//!
//! Every write operation borrows one connection for a whole transaction
//! while the owning book lock is held, so widening the pool past the number
//! of concurrently active books plus the read/relay traffic buys nothing.
//! The pool is kept moderate and the acquire timeout short, so saturation
//! surfaces as fast failures rather than queued requests.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::AppConfig;

/// Readiness probe budget
const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
        // Liveness is covered by the readiness ping; no per-acquire test
        // round trip on the placement path.
        .test_before_acquire(false)
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        max_connections = config.db_max_connections,
        min_connections = config.db_min_connections,
        acquire_timeout_secs = config.db_acquire_timeout_secs,
        "database pool established"
    );

    Ok(pool)
}

/// Ping the database within the readiness budget
pub async fn ping(pool: &PgPool) -> bool {
    let probe = sqlx::query("SELECT 1").fetch_one(pool);
    matches!(tokio::time::timeout(PING_TIMEOUT, probe).await, Ok(Ok(_)))
}
