use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, IntCounter, IntGauge, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref EVALUATIONS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_evaluations_total",
        "Total number of rule evaluations.",
        REGISTRY
    )
    .unwrap();
    pub static ref EVALUATION_FAILURES_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_evaluation_failures_total",
        "Total number of failed rule evaluations.",
        REGISTRY
    )
    .unwrap();
    pub static ref EVALUATION_DURATION_SECONDS: Histogram = register_histogram_with_registry!(
        "ruler_evaluation_duration_seconds",
        "Duration of rule group evaluation passes.",
        REGISTRY
    )
    .unwrap();
    pub static ref TICKS_DROPPED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_ticks_dropped_total",
        "Evaluation ticks dropped because the previous pass for the group was still running.",
        REGISTRY
    )
    .unwrap();
    pub static ref INVALID_GROUPS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_invalid_rule_groups_total",
        "Rule groups excluded from scheduling due to definition errors.",
        REGISTRY
    )
    .unwrap();
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_notifications_sent_total",
        "Alert notifications accepted by a receiver endpoint.",
        REGISTRY
    )
    .unwrap();
    pub static ref NOTIFICATION_FAILURES_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_notification_failures_total",
        "Alert notification batches that failed across all receiver endpoints.",
        REGISTRY
    )
    .unwrap();
    pub static ref NOTIFICATIONS_DROPPED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ruler_notifications_dropped_total",
        "Alert notifications dropped due to a full outbound queue.",
        REGISTRY
    )
    .unwrap();
    pub static ref GROUPS_RUNNING: IntGauge = register_int_gauge_with_registry!(
        "ruler_rule_groups_running",
        "Rule group schedulers currently running on this instance.",
        REGISTRY
    )
    .unwrap();
    pub static ref RING_TOPOLOGY_VERSION: IntGauge = register_int_gauge_with_registry!(
        "ruler_ring_topology_version",
        "Last observed membership ring topology version.",
        REGISTRY
    )
    .unwrap();
}

/// Gather all registered metrics in the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
