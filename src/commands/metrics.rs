//! Metrics query command

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use std::path::Path;
use telemetry_bus::observability::filter::MetricFilterParams;
use telemetry_bus::observability::{EventStore, MetricFilter, MetricRecord};

use super::{open_store, since_seconds};

/// Query and display metric samples
#[derive(Debug, Clone, Parser)]
pub struct MetricsArgs {
    /// Comma separated metric types (cpu, memory, response_time, ...)
    #[arg(short = 't', long = "type")]
    pub types: Option<String>,

    /// Minimum value (inclusive)
    #[arg(long)]
    pub min_value: Option<String>,

    /// Maximum value (inclusive)
    #[arg(long)]
    pub max_value: Option<String>,

    /// Comma separated `key:value` tag pairs that must all match
    #[arg(long)]
    pub tags: Option<String>,

    /// Show samples since N seconds ago
    #[arg(long)]
    pub since: Option<u64>,

    /// Lower time bound (ISO-8601)
    #[arg(long)]
    pub from: Option<String>,

    /// Upper time bound (ISO-8601)
    #[arg(long)]
    pub to: Option<String>,

    /// Maximum number of results
    #[arg(long, default_value = "100")]
    pub limit: usize,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,
}

impl MetricsArgs {
    fn to_filter(&self) -> MetricFilter {
        let mut filter = MetricFilterParams {
            types: self.types.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            min_value: self.min_value.clone(),
            max_value: self.max_value.clone(),
            tags: self.tags.clone(),
            limit: None,
        }
        .into_filter();

        if let Some(seconds) = self.since {
            filter.from = Some(since_seconds(seconds));
        }
        filter.limit = Some(self.limit);
        filter
    }
}

pub async fn execute(args: MetricsArgs, config_path: Option<&Path>) -> Result<()> {
    let store = open_store(config_path).await?;
    let metrics: Vec<MetricRecord> = store.query(&args.to_filter()).await?;

    if metrics.is_empty() {
        println!("{}", "No metrics found matching the criteria".yellow());
        return Ok(());
    }

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    println!("{}", format!("Found {} metric samples", metrics.len()).bold());
    println!();

    for metric in &metrics {
        let timestamp = metric
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_default();
        let tags = metric
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        println!(
            "{} {:<14} {:>12} {:<4} {} {}",
            timestamp.dimmed(),
            metric.metric_type.as_str().cyan(),
            format!("{:.2}", metric.value).bold(),
            metric.unit,
            metric.host.as_deref().unwrap_or("-"),
            tags.dimmed()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_bus::observability::MetricType;

    #[test]
    fn test_args_to_filter() {
        let args = MetricsArgs::parse_from(["metrics", "--type", "cpu,memory", "--tags", "host:a", "--min-value", "10"]);
        let filter = args.to_filter();

        assert_eq!(filter.types, vec![MetricType::Cpu, MetricType::Memory]);
        assert_eq!(filter.tags.get("host").map(String::as_str), Some("a"));
        assert_eq!(filter.min_value, Some(10.0));
        assert_eq!(filter.limit, Some(100));
    }
}
