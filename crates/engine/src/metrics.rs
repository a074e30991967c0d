use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all engine metrics
const PREFIX: &str = "workflow";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Engine operations
    pub static ref OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_operations_total"), "Engine operations by outcome"),
        &["operation", "origin", "trigger", "outcome"]
    ).expect("Failed to create operations_total metric");

    pub static ref OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_operation_duration_seconds"),
            "Engine operation duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["operation", "origin"]
    ).expect("Failed to create operation_duration_seconds metric");

    // Event emission
    pub static ref EMIT_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_emit_total"), "Event emission attempts by outcome"),
        &["topic", "outcome"]
    ).expect("Failed to create emit_total metric");

    pub static ref EMIT_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_emit_errors_total"), "Failed event emissions"),
        &["topic", "origin"]
    ).expect("Failed to create emit_errors_total metric");

    // Background work
    pub static ref RECONCILER_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_reconciler_events_total"), "Emit-failure events processed by the reconciler"),
        &["result"]
    ).expect("Failed to create reconciler_events_total metric");

    pub static ref CLEANUP_DELETED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_cleanup_deleted_total"),
        "Orphaned workflow instances deleted"
    ).expect("Failed to create cleanup_deleted_total metric");
}

/// Register all metrics with the engine registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(OPERATION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(EMIT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(EMIT_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILER_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CLEANUP_DELETED_TOTAL.clone()));

    tracing::debug!("Workflow metrics registered");
}

pub fn record_operation(operation: &str, origin: &str, trigger: &str, outcome: &str, duration: Duration) {
    OPERATIONS_TOTAL
        .with_label_values(&[operation, origin, trigger, outcome])
        .inc();
    OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, origin])
        .observe(duration.as_secs_f64());
}

pub fn record_emit(topic: &str, origin: &str, ok: bool) {
    let outcome = if ok { "success" } else { "failure" };
    EMIT_TOTAL.with_label_values(&[topic, outcome]).inc();
    if !ok {
        EMIT_ERRORS_TOTAL.with_label_values(&[topic, origin]).inc();
    }
}

pub fn record_reconciled(result: &str, count: u64) {
    RECONCILER_EVENTS_TOTAL
        .with_label_values(&[result])
        .inc_by(count as f64);
}

pub fn record_cleanup(deleted: u64) {
    CLEANUP_DELETED_TOTAL.inc_by(deleted);
}

/// Text exposition of every registered metric
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
