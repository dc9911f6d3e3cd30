use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder
///
/// Fails when a recorder is already installed (e.g. a second call in tests).
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    init_metric_descriptions();

    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally
///
/// Renders an empty exposition; used where the process-wide recorder is not wanted.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn init_metric_descriptions() {
    describe_counter!("bus_published_total", "Records published on a live bus");
    describe_counter!("bus_delivered_total", "Records delivered to subscribers");
    describe_counter!(
        "bus_dropped_total",
        "Records dropped because a bounded queue was full"
    );
    describe_gauge!("bus_subscribers", "Currently registered bus subscribers");
    describe_histogram!(
        "store_flush_duration_seconds",
        "Time spent writing one batch to the store"
    );
    describe_counter!("store_flush_errors_total", "Batches the store rejected");
    describe_counter!(
        "threshold_breaches_total",
        "Metric samples crossing a configured threshold"
    );
    describe_gauge!("stream_sessions", "Open streaming sessions");
    describe_gauge!("telemetry_bus_info", "Build information");

    gauge!("telemetry_bus_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_published(kind: &'static str) {
    counter!("bus_published_total", "kind" => kind).increment(1);
}

pub fn record_delivered(kind: &'static str, count: u64) {
    if count > 0 {
        counter!("bus_delivered_total", "kind" => kind).increment(count);
    }
}

/// `path` is either "subscriber" (drop-oldest) or "writer" (drop-new)
pub fn record_dropped(kind: &'static str, path: &'static str) {
    counter!("bus_dropped_total", "kind" => kind, "path" => path).increment(1);
}

pub fn set_subscribers(kind: &'static str, count: usize) {
    gauge!("bus_subscribers", "kind" => kind).set(count as f64);
}

pub fn record_flush(kind: &'static str, duration: Duration) {
    histogram!("store_flush_duration_seconds", "kind" => kind).record(duration.as_secs_f64());
}

pub fn record_flush_error(kind: &'static str) {
    counter!("store_flush_errors_total", "kind" => kind).increment(1);
}

pub fn record_threshold_breach(metric_type: &'static str, severity: &'static str) {
    counter!(
        "threshold_breaches_total",
        "type" => metric_type,
        "severity" => severity,
    )
    .increment(1);
}

pub fn set_sessions(kind: &'static str, count: usize) {
    gauge!("stream_sessions", "kind" => kind).set(count as f64);
}
