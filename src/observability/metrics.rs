//! Prometheus metrics for the exchange

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry, TextEncoder,
};

/// All metrics, registered against a dedicated registry so tests can build
/// isolated instances.
pub struct Metrics {
    registry: Registry,

    // Order operations
    pub orders_placed_total: IntCounterVec,
    pub orders_cancelled_total: IntCounterVec,
    pub orders_settled_total: IntCounterVec,
    pub orders_matched_total: IntCounterVec,

    // Order amounts
    pub order_amount_total: prometheus::Counter,
    pub order_payout_total: prometheus::Counter,

    // Active orders gauge
    pub active_orders: IntGauge,

    // Performance
    pub order_placement_duration: HistogramVec,
    pub order_matching_duration: Histogram,

    // Database
    pub database_operation_duration: HistogramVec,
    pub database_errors: CounterVec,

    // Outbox relay
    pub outbox_events_published: IntCounterVec,
    pub outbox_events_failed: IntCounterVec,
    pub outbox_poll_errors: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_placed_total = IntCounterVec::new(
            Opts::new("orderbook_orders_placed_total", "Total orders placed"),
            &["market", "side"],
        )
        .unwrap();

        let orders_cancelled_total = IntCounterVec::new(
            Opts::new("orderbook_orders_cancelled_total", "Total orders cancelled"),
            &["side"],
        )
        .unwrap();

        let orders_settled_total = IntCounterVec::new(
            Opts::new("orderbook_orders_settled_total", "Total orders settled"),
            &["result"],
        )
        .unwrap();

        let orders_matched_total = IntCounterVec::new(
            Opts::new("orderbook_orders_matched_total", "Total orders matched"),
            &["match_type"],
        )
        .unwrap();

        let order_amount_total = prometheus::Counter::new(
            "orderbook_order_amount_total",
            "Total stake of all orders placed",
        )
        .unwrap();

        let order_payout_total = prometheus::Counter::new(
            "orderbook_order_payout_total",
            "Total payout of settled winning orders",
        )
        .unwrap();

        let active_orders = IntGauge::new(
            "orderbook_active_orders",
            "Number of currently active orders",
        )
        .unwrap();

        let order_placement_duration = HistogramVec::new(
            HistogramOpts::new(
                "orderbook_order_placement_duration_seconds",
                "Duration of order placement operations",
            ),
            &["status"],
        )
        .unwrap();

        let order_matching_duration = Histogram::with_opts(HistogramOpts::new(
            "orderbook_order_matching_duration_seconds",
            "Duration of the in-book matching walk",
        ))
        .unwrap();

        let database_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "orderbook_database_operation_duration_seconds",
                "Duration of database operations",
            ),
            &["operation"],
        )
        .unwrap();

        let database_errors = CounterVec::new(
            Opts::new("orderbook_database_errors_total", "Total database errors"),
            &["operation"],
        )
        .unwrap();

        let outbox_events_published = IntCounterVec::new(
            Opts::new(
                "orderbook_outbox_events_published_total",
                "Outbox events successfully published",
            ),
            &["event_type"],
        )
        .unwrap();

        let outbox_events_failed = IntCounterVec::new(
            Opts::new(
                "orderbook_outbox_events_failed_total",
                "Outbox events that failed to publish",
            ),
            &["event_type"],
        )
        .unwrap();

        let outbox_poll_errors = IntCounter::new(
            "orderbook_outbox_poll_errors_total",
            "Outbox drain cycles that failed before publishing",
        )
        .unwrap();

        registry
            .register(Box::new(orders_placed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(orders_cancelled_total.clone()))
            .unwrap();
        registry
            .register(Box::new(orders_settled_total.clone()))
            .unwrap();
        registry
            .register(Box::new(orders_matched_total.clone()))
            .unwrap();
        registry
            .register(Box::new(order_amount_total.clone()))
            .unwrap();
        registry
            .register(Box::new(order_payout_total.clone()))
            .unwrap();
        registry.register(Box::new(active_orders.clone())).unwrap();
        registry
            .register(Box::new(order_placement_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(order_matching_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(database_operation_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(database_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(outbox_events_published.clone()))
            .unwrap();
        registry
            .register(Box::new(outbox_events_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(outbox_poll_errors.clone()))
            .unwrap();

        Self {
            registry,
            orders_placed_total,
            orders_cancelled_total,
            orders_settled_total,
            orders_matched_total,
            order_amount_total,
            order_payout_total,
            active_orders,
            order_placement_duration,
            order_matching_duration,
            database_operation_duration,
            database_errors,
            outbox_events_published,
            outbox_events_failed,
            outbox_poll_errors,
        }
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        let metrics = Metrics::new();
        metrics
            .orders_placed_total
            .with_label_values(&["match-winner", "BACK"])
            .inc();
        metrics.active_orders.set(3);

        let output = metrics.render();
        assert!(output.contains("orderbook_orders_placed_total"));
        assert!(output.contains("orderbook_active_orders 3"));
    }

    #[test]
    fn test_isolated_registries() {
        // Two instances must not clash on registration
        let a = Metrics::new();
        let b = Metrics::new();
        a.active_orders.set(1);
        b.active_orders.set(2);
        assert!(a.render().contains("orderbook_active_orders 1"));
        assert!(b.render().contains("orderbook_active_orders 2"));
    }
}
