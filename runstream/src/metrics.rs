//! Prometheus metrics instrumentation for runstream.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `runstream_runs_created_total` - Runs persisted, by stateful/stateless kind
//! - `runstream_runs_completed_total` - Runs reaching a terminal status
//! - `runstream_runs_cancelled_total` - Runs targeted by a cancellation
//! - `runstream_events_published_total` - Engine events appended to run channels
//!
//! ## Gauges
//! - `runstream_active_joins` - Open client joins by mode
//!
//! ## Histograms
//! - `runstream_run_duration_seconds` - Engine execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for runstream metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `kind`: `stateful` or `stateless`
pub static RUNS_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runstream_runs_created_total", "Total number of runs created");
    CounterVec::new(opts, &["kind"]).expect("runstream_runs_created_total metric creation failed")
});

/// Labels:
/// - `status`: terminal run status
pub static RUNS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runstream_runs_completed_total",
        "Total number of runs that reached a terminal status",
    );
    CounterVec::new(opts, &["status"])
        .expect("runstream_runs_completed_total metric creation failed")
});

/// Labels:
/// - `action`: `interrupt` or `rollback`
pub static RUNS_CANCELLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runstream_runs_cancelled_total",
        "Total number of runs targeted by cancellation",
    );
    CounterVec::new(opts, &["action"])
        .expect("runstream_runs_cancelled_total metric creation failed")
});

/// Labels:
/// - `mode`: stream mode of the event
pub static EVENTS_PUBLISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runstream_events_published_total",
        "Total number of events published into run channels",
    );
    CounterVec::new(opts, &["mode"])
        .expect("runstream_events_published_total metric creation failed")
});

/// Labels:
/// - `mode`: `stream`, `wait` or `join`
pub static ACTIVE_JOINS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("runstream_active_joins", "Currently open client joins");
    GaugeVec::new(opts, &["mode"]).expect("runstream_active_joins metric creation failed")
});

/// Labels:
/// - `status`: terminal run status
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "runstream_run_duration_seconds",
        "Run execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("runstream_run_duration_seconds metric creation failed")
});

/// Register every collector with the global registry.
///
/// Idempotent; repeated calls are no-ops.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_CREATED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_COMPLETED_TOTAL.clone()),
        Box::new(RUNS_CANCELLED_TOTAL.clone()),
        Box::new(EVENTS_PUBLISHED_TOTAL.clone()),
        Box::new(ACTIVE_JOINS.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
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

pub fn record_run_created(kind: &str) {
    RUNS_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_run_completed(status: &str) {
    RUNS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_runs_cancelled(action: &str, count: u64) {
    RUNS_CANCELLED_TOTAL
        .with_label_values(&[action])
        .inc_by(count as f64);
}

pub fn record_event_published(mode: &str) {
    EVENTS_PUBLISHED_TOTAL.with_label_values(&[mode]).inc();
}

pub fn adjust_active_joins(mode: &str, delta: f64) {
    ACTIVE_JOINS.with_label_values(&[mode]).add(delta);
}

pub fn observe_run_duration(status: &str, duration_secs: f64) {
    RUN_DURATION_SECONDS
        .with_label_values(&[status])
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_join_gauge_balances() {
        adjust_active_joins("test_mode", 1.0);
        adjust_active_joins("test_mode", -1.0);
        assert_eq!(ACTIVE_JOINS.with_label_values(&["test_mode"]).get(), 0.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_run_created("stateless");
        record_run_completed("success");
        record_event_published("values");
        observe_run_duration("success", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("runstream_runs_created_total"));
        assert!(output.contains("runstream_runs_completed_total"));
        assert!(output.contains("runstream_run_duration_seconds"));
    }
}
