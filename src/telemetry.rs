//! Tracing and telemetry instrumentation for the reconciler.
//!
//! Helper functions for creating tracing spans and recording metrics during
//! the reconciliation lifecycle. All functions work both with and without the
//! `metrics` feature flag.

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Create a tracing span for dispatching one operation to a component
/// reconciler.
#[must_use]
pub fn dispatch_span(correlation_id: impl AsRef<str>, component: impl AsRef<str>) -> Span {
    info_span!(
        "reconciler.dispatch",
        correlation_id = %correlation_id.as_ref(),
        component = %component.as_ref(),
    )
}

/// Create a tracing span for ingesting one heartbeat callback.
#[must_use]
pub fn callback_span(
    scheduling_id: impl AsRef<str>,
    correlation_id: impl AsRef<str>,
) -> Span {
    info_span!(
        "reconciler.callback",
        scheduling_id = %scheduling_id.as_ref(),
        correlation_id = %correlation_id.as_ref(),
    )
}

/// Create a tracing span for scheduling a cluster.
#[must_use]
pub fn scheduling_span(runtime_id: impl AsRef<str>) -> Span {
    info_span!(
        "reconciler.schedule",
        runtime_id = %runtime_id.as_ref(),
    )
}

/// Create a tracing span for a periodic sweep (bookkeeper, cleaner).
#[must_use]
pub fn sweep_span(sweep: impl AsRef<str>) -> Span {
    info_span!(
        "reconciler.sweep",
        sweep = %sweep.as_ref(),
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    correlation_id: impl AsRef<str>,
    component: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = dispatch_span(correlation_id, component);
    future.instrument(span)
}

/// Record a dispatch attempt outcome in logs and metrics.
pub fn record_operation_dispatched(component: impl AsRef<str>, result: impl AsRef<str>) {
    tracing::info!(
        component = %component.as_ref(),
        result = %result.as_ref(),
        "operation dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_operation_dispatched(component.as_ref(), result.as_ref());
}

/// Record an ingested heartbeat callback in logs and metrics.
pub fn record_callback_received(status: impl AsRef<str>) {
    tracing::debug!(status = %status.as_ref(), "callback received");

    #[cfg(feature = "metrics")]
    crate::metrics::record_callback_received(status.as_ref());
}

/// Record a finished reconciliation in logs and metrics.
pub fn record_reconciliation_finished(
    runtime_id: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    tracing::info!(
        runtime_id = %runtime_id.as_ref(),
        status = %status.as_ref(),
        "reconciliation finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_reconciliation_finished(status.as_ref());
}

/// Update the worker pool occupancy in metrics.
pub fn set_worker_pool_occupancy(busy: usize) {
    tracing::trace!(busy, "worker pool occupancy updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_worker_pool_occupancy(busy);
}

/// Observe the duration of one invoker call.
pub fn observe_dispatch_duration(component: impl AsRef<str>, duration_secs: f64) {
    tracing::debug!(
        component = %component.as_ref(),
        duration_secs,
        "dispatch duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_dispatch_duration(component.as_ref(), duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_span() {
        let span = dispatch_span("corr-1", "istio");
        assert_eq!(span.metadata().unwrap().name(), "reconciler.dispatch");
    }

    #[test]
    fn test_callback_span() {
        let span = callback_span("sched-1", "corr-1");
        assert_eq!(span.metadata().unwrap().name(), "reconciler.callback");
    }

    #[test]
    fn test_scheduling_span() {
        let span = scheduling_span("rt-1");
        assert_eq!(span.metadata().unwrap().name(), "reconciler.schedule");
    }

    #[test]
    fn test_sweep_span() {
        let span = sweep_span("bookkeeper");
        assert_eq!(span.metadata().unwrap().name(), "reconciler.sweep");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_operation_dispatched("istio", "accepted");
        record_callback_received("running");
        record_reconciliation_finished("rt-1", "ready");
        set_worker_pool_occupancy(1);
        observe_dispatch_duration("istio", 0.1);
    }
}
