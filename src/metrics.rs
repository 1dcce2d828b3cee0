//! Prometheus metrics instrumentation for the reconciler.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `reconciler_operations_dispatched_total` - Run requests sent to component reconcilers
//! - `reconciler_callbacks_received_total` - Heartbeat callbacks ingested
//! - `reconciler_reconciliations_finished_total` - Reconciliations completed, by final status
//!
//! ## Gauges
//! - `reconciler_worker_pool_occupancy` - Dispatch slots currently busy
//!
//! ## Histograms
//! - `reconciler_dispatch_duration_seconds` - Invoker call duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for reconciler metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for run requests sent to component reconcilers.
///
/// Labels:
/// - `component`: The component being reconciled
/// - `result`: The dispatch outcome (accepted, failed)
pub static OPERATIONS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "reconciler_operations_dispatched_total",
        "Run requests sent to component reconcilers",
    );
    CounterVec::new(opts, &["component", "result"])
        .expect("reconciler_operations_dispatched_total metric creation failed")
});

/// Counter for heartbeat callbacks ingested.
///
/// Labels:
/// - `status`: The reported callback status
pub static CALLBACKS_RECEIVED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "reconciler_callbacks_received_total",
        "Heartbeat callbacks ingested",
    );
    CounterVec::new(opts, &["status"])
        .expect("reconciler_callbacks_received_total metric creation failed")
});

/// Counter for completed reconciliations.
///
/// Labels:
/// - `status`: The final cluster status (ready, error, deleted, delete_error)
pub static RECONCILIATIONS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "reconciler_reconciliations_finished_total",
        "Reconciliations completed, by final status",
    );
    CounterVec::new(opts, &["status"])
        .expect("reconciler_reconciliations_finished_total metric creation failed")
});

/// Gauge for dispatch slots currently busy.
pub static WORKER_POOL_OCCUPANCY: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "reconciler_worker_pool_occupancy",
        "Dispatch slots currently busy",
    )
    .expect("reconciler_worker_pool_occupancy metric creation failed")
});

/// Histogram for invoker call duration in seconds.
///
/// Labels:
/// - `component`: The component being reconciled
pub static DISPATCH_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "reconciler_dispatch_duration_seconds",
        "Invoker call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["component"])
        .expect("reconciler_dispatch_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(OPERATIONS_DISPATCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(CALLBACKS_RECEIVED_TOTAL.clone()),
        Box::new(RECONCILIATIONS_FINISHED_TOTAL.clone()),
        Box::new(WORKER_POOL_OCCUPANCY.clone()),
        Box::new(DISPATCH_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record a dispatch attempt outcome.
pub fn record_operation_dispatched(component: &str, result: &str) {
    OPERATIONS_DISPATCHED_TOTAL
        .with_label_values(&[component, result])
        .inc();
}

/// Helper to record an ingested callback.
pub fn record_callback_received(status: &str) {
    CALLBACKS_RECEIVED_TOTAL.with_label_values(&[status]).inc();
}

/// Helper to record a finished reconciliation.
pub fn record_reconciliation_finished(status: &str) {
    RECONCILIATIONS_FINISHED_TOTAL
        .with_label_values(&[status])
        .inc();
}

/// Helper to update the worker pool occupancy gauge.
pub fn set_worker_pool_occupancy(busy: usize) {
    WORKER_POOL_OCCUPANCY.set(busy as f64);
}

/// Helper to observe an invoker call duration.
pub fn observe_dispatch_duration(component: &str, duration_secs: f64) {
    DISPATCH_DURATION_SECONDS
        .with_label_values(&[component])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
