mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics - Prometheus instrumentation for the order core
// ============================================================================
//
// - Order transitions (by from/to)
// - Concurrency control (lock contention, version conflicts)
// - Payment callbacks and gateway calls
// - Read cache hit ratio
// - Stock rejections and reconciler actions
// - Operation latency
//
// The registry is owned here, never global; scrape it via /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    pub order_transitions: IntCounterVec,
    pub orders_created: IntCounter,

    pub lock_busy: IntCounterVec,
    pub version_conflicts: IntCounterVec,

    pub payment_callbacks: IntCounterVec,
    pub gateway_calls: IntCounterVec,

    pub cache_lookups: IntCounterVec,
    pub stock_rejections: IntCounter,
    pub reconciler_actions: IntCounterVec,

    pub operation_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let order_transitions = IntCounterVec::new(
            Opts::new("order_transitions_total", "Committed order status transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(order_transitions.clone()))?;

        let orders_created = IntCounter::new("orders_created_total", "Orders created")?;
        registry.register(Box::new(orders_created.clone()))?;

        let lock_busy = IntCounterVec::new(
            Opts::new("order_lock_busy_total", "Mutations rejected because the order lock was held"),
            &["operation"],
        )?;
        registry.register(Box::new(lock_busy.clone()))?;

        let version_conflicts = IntCounterVec::new(
            Opts::new("order_version_conflicts_total", "Conditional writes that matched no row"),
            &["operation"],
        )?;
        registry.register(Box::new(version_conflicts.clone()))?;

        let payment_callbacks = IntCounterVec::new(
            Opts::new("payment_callbacks_total", "Gateway callbacks by acknowledgement"),
            &["outcome"],
        )?;
        registry.register(Box::new(payment_callbacks.clone()))?;

        let gateway_calls = IntCounterVec::new(
            Opts::new("gateway_calls_total", "Outbound gateway calls"),
            &["method", "call", "outcome"],
        )?;
        registry.register(Box::new(gateway_calls.clone()))?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("order_cache_lookups_total", "Read cache lookups"),
            &["kind", "result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let stock_rejections = IntCounter::new(
            "stock_rejections_total",
            "Order creations aborted by insufficient stock",
        )?;
        registry.register(Box::new(stock_rejections.clone()))?;

        let reconciler_actions = IntCounterVec::new(
            Opts::new("reconciler_actions_total", "Orders touched by the expiry reconciler"),
            &["action"],
        )?;
        registry.register(Box::new(reconciler_actions.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("order_operation_duration_seconds", "Mutating operation latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            registry,
            order_transitions,
            orders_created,
            lock_busy,
            version_conflicts,
            payment_callbacks,
            gateway_calls,
            cache_lookups,
            stock_rejections,
            reconciler_actions,
            operation_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.order_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_lock_busy(&self, operation: &str) {
        self.lock_busy.with_label_values(&[operation]).inc();
    }

    pub fn record_version_conflict(&self, operation: &str) {
        self.version_conflicts.with_label_values(&[operation]).inc();
    }

    pub fn record_callback(&self, outcome: &str) {
        self.payment_callbacks.with_label_values(&[outcome]).inc();
    }

    pub fn record_gateway_call(&self, method: &str, call: &str, outcome: &str) {
        self.gateway_calls.with_label_values(&[method, call, outcome]).inc();
    }

    pub fn record_cache_lookup(&self, kind: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[kind, result]).inc();
    }

    pub fn record_reconciler_action(&self, action: &str, count: u64) {
        self.reconciler_actions.with_label_values(&[action]).inc_by(count);
    }

    pub fn observe_operation(&self, operation: &str, duration_secs: f64) {
        self.operation_duration.with_label_values(&[operation]).observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().map(|s| s.counter.value.unwrap_or_default()).sum())
            .unwrap_or_default()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.orders_created.inc();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_transition_by_pair() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transition("pending", "paid");
        metrics.record_transition("pending", "paid");
        metrics.record_transition("paid", "shipped");

        let gathered = metrics.registry.gather();
        let transitions = gathered.iter().find(|m| m.name() == "order_transitions_total").unwrap();
        assert_eq!(transitions.metric.len(), 2);
        assert_eq!(counter_value(&metrics, "order_transitions_total"), 3.0);
    }

    #[test]
    fn test_cache_lookup_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_cache_lookup("order", true);
        metrics.record_cache_lookup("order", false);
        metrics.record_cache_lookup("stats", false);
        assert_eq!(counter_value(&metrics, "order_cache_lookups_total"), 3.0);
    }

    #[test]
    fn test_reconciler_actions_accumulate() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconciler_action("cancelled", 4);
        metrics.record_reconciler_action("cancelled", 0);
        assert_eq!(counter_value(&metrics, "reconciler_actions_total"), 4.0);
    }
}
