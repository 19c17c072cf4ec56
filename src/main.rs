use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use sqlx::PgPool;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod models;
mod observability;
mod repository;
mod services;

use crate::config::AppConfig;
use crate::observability::Metrics;
use crate::repository::{
    IdempotencyRepository, MatchRepository, OrderRepository, OutboxRepository,
};
use crate::services::matching::MatchingEngine;
use crate::services::orders::OrderService;
use crate::services::outbox::{OutboxRelay, RedisStreamProducer};

pub struct AppState {
    pub config: AppConfig,
    pub pool: PgPool,
    pub engine: Arc<MatchingEngine>,
    pub order_service: OrderService,
    pub metrics: Arc<Metrics>,
    pub producer_ready: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "betting_exchange_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting betting exchange backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    // Initialize database
    let pool = db::connect(&config).await?;
    tracing::info!("Database connected");

    // Metrics registry
    let metrics = Arc::new(Metrics::new());

    // Repositories share the pool; each transaction borrows one connection
    let order_repo = OrderRepository::new(pool.clone(), metrics.clone());
    let match_repo = MatchRepository::new(pool.clone(), metrics.clone());
    let outbox_repo = OutboxRepository::new(pool.clone(), metrics.clone());
    let idempotency_repo = IdempotencyRepository::new(pool.clone(), metrics.clone());

    // Rebuild the in-memory books from the durable order log
    let engine = Arc::new(MatchingEngine::new());
    match engine.recover(&order_repo).await {
        Ok(count) => {
            if count > 0 {
                tracing::info!("Recovered {} live orders into the books", count);
            } else {
                tracing::info!("No live orders to recover");
            }
            metrics.active_orders.set(count as i64);
        }
        Err(e) => {
            tracing::error!("Failed to recover order books: {}", e);
            tracing::warn!("Starting with empty books");
        }
    }

    // Event bus producer; required before the relay can drain
    let producer = RedisStreamProducer::connect(&config.redis_url).await?;

    let order_service = OrderService::new(
        pool.clone(),
        order_repo,
        match_repo,
        outbox_repo.clone(),
        idempotency_repo.clone(),
        engine.clone(),
        metrics.clone(),
    );

    // Outbox relay worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = OutboxRelay::new(outbox_repo.clone(), producer, metrics.clone())
        .with_poll_interval(Duration::from_millis(config.outbox_poll_interval_ms))
        .with_batch_size(config.outbox_batch_size);
    let relay_handle = tokio::spawn(relay.run(shutdown_rx));
    tracing::info!("Outbox relay spawned");

    // Periodic maintenance: processed-event retention and expired
    // idempotency keys
    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs);
    let retention = chrono::Duration::hours(config.outbox_retention_hours);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = outbox_repo.cleanup_processed_events(retention).await {
                tracing::error!("Outbox cleanup failed: {}", e);
            }
            if let Err(e) = idempotency_repo.cleanup_expired().await {
                tracing::error!("Idempotency cleanup failed: {}", e);
            }
        }
    });
    tracing::info!("Maintenance worker spawned");

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        engine,
        order_service,
        metrics,
        producer_ready: true,
    });

    // Build router
    let app = Router::new()
        .route("/health", get(api::handlers::health::health))
        .route("/ready", get(api::handlers::health::ready))
        .route("/metrics", get(api::handlers::health::metrics))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the relay between polls; an in-flight publish completes first
    let _ = shutdown_tx.send(true);
    let _ = relay_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
