//! Periodic host CPU and memory sampling
//!
//! Samples go through [`MetricsService::record_metric`] like any other caller,
//! so they are persisted, streamed and checked against thresholds.

use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;

use super::record::{MetricRecord, MetricType};
use super::service::MetricsService;

const SOURCE_TAG: &str = "system_collector";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Round to two decimals
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// CPU utilization sample from a global usage reading
pub fn cpu_sample(usage: f32, cores: usize, host: &str) -> MetricRecord {
    let usage = round2(f64::from(usage).clamp(0.0, 100.0));
    MetricRecord::new(MetricType::Cpu, usage, "%")
        .with_host(host)
        .with_tag("host", host)
        .with_tag("source", SOURCE_TAG)
        .with_tag("cores", cores.to_string())
}

/// Memory percentage plus absolute used megabytes
///
/// Returns nothing when the total is unknown.
pub fn memory_samples(total_bytes: u64, used_bytes: u64, host: &str) -> Option<[MetricRecord; 2]> {
    if total_bytes == 0 {
        return None;
    }

    let total_mb = total_bytes as f64 / BYTES_PER_MB;
    let used_mb = used_bytes.min(total_bytes) as f64 / BYTES_PER_MB;
    let percent = round2(used_mb / total_mb * 100.0);

    let usage = MetricRecord::new(MetricType::Memory, percent, "%")
        .with_host(host)
        .with_tag("host", host)
        .with_tag("source", SOURCE_TAG)
        .with_tag("total_mb", format!("{:.0}", total_mb))
        .with_tag("free_mb", format!("{:.0}", total_mb - used_mb));

    let used = MetricRecord::new(MetricType::MemoryUsed, round2(used_mb), "MB")
        .with_host(host)
        .with_tag("host", host)
        .with_tag("source", SOURCE_TAG);

    Some([usage, used])
}

/// Sample the host every `every` until the task is aborted
pub fn spawn_system_collector(metrics: MetricsService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let host = metrics.default_host().to_string();
        let mut system = System::new();
        // CPU usage is a delta between two refreshes
        system.refresh_cpu();

        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        tracing::info!(interval_secs = every.as_secs(), host = %host, "System collector started");

        loop {
            interval.tick().await;

            system.refresh_cpu();
            system.refresh_memory();

            let cores = system.cpus().len();
            if cores == 0 {
                tracing::warn!("No CPU information available, skipping CPU sample");
            } else {
                metrics.record_metric(cpu_sample(system.global_cpu_info().cpu_usage(), cores, &host));
            }

            match memory_samples(system.total_memory(), system.used_memory(), &host) {
                Some(samples) => {
                    for sample in samples {
                        metrics.record_metric(sample);
                    }
                }
                None => tracing::warn!("Total memory reported as zero, skipping memory sample"),
            }
        }
    })
}
