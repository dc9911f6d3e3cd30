//! Warning / critical bounds evaluated against every recorded metric
//!
//! The table is swapped wholesale on update, so evaluation never locks.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::record::{LogLevel, LogRecord, MetricRecord, MetricType};

/// Context attached to derived log records
pub const THRESHOLD_LOG_CONTEXT: &str = "MetricsService";

/// Bounds for one metric kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricThreshold {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    // Config sources may hand keys over lowercased or in snake_case
    #[serde(alias = "warningthreshold", alias = "warning_threshold")]
    pub warning_threshold: f64,
    #[serde(alias = "criticalthreshold", alias = "critical_threshold")]
    pub critical_threshold: f64,
}

impl MetricThreshold {
    pub fn new(metric_type: MetricType, warning: f64, critical: f64) -> Self {
        Self {
            metric_type,
            warning_threshold: warning,
            critical_threshold: critical,
        }
    }
}

/// Built-in table
pub fn default_thresholds() -> Vec<MetricThreshold> {
    vec![
        MetricThreshold::new(MetricType::Cpu, 70.0, 90.0),
        MetricThreshold::new(MetricType::Memory, 75.0, 90.0),
        MetricThreshold::new(MetricType::ResponseTime, 500.0, 1000.0),
        MetricThreshold::new(MetricType::ErrorRate, 5.0, 10.0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A metric sample that crossed a bound
#[derive(Debug, Clone)]
pub struct ThresholdBreach {
    pub severity: Severity,
    pub threshold: MetricThreshold,
    pub metric: MetricRecord,
}

impl ThresholdBreach {
    /// The bound that was crossed
    pub fn bound(&self) -> f64 {
        match self.severity {
            Severity::Warning => self.threshold.warning_threshold,
            Severity::Critical => self.threshold.critical_threshold,
        }
    }

    pub fn message(&self) -> String {
        let prefix = match self.severity {
            Severity::Critical => "CRITICAL THRESHOLD EXCEEDED",
            Severity::Warning => "Warning threshold exceeded",
        };
        format!(
            "{}: {} = {}{} (threshold: {}{})",
            prefix,
            self.metric.metric_type,
            self.metric.value,
            self.metric.unit,
            self.bound(),
            self.metric.unit
        )
    }

    /// The derived log record for this breach
    pub fn to_log(&self) -> LogRecord {
        let level = match self.severity {
            Severity::Critical => LogLevel::Error,
            Severity::Warning => LogLevel::Warn,
        };
        LogRecord::new(level, self.message())
            .with_context(THRESHOLD_LOG_CONTEXT)
            .with_additional_info(json!({
                "metric": self.metric,
                "threshold": self.threshold,
            }))
    }
}

/// Runtime-mutable threshold table
pub struct ThresholdMonitor {
    table: ArcSwap<Vec<MetricThreshold>>,
}

impl ThresholdMonitor {
    pub fn new(thresholds: Vec<MetricThreshold>) -> Self {
        Self {
            table: ArcSwap::from_pointee(thresholds),
        }
    }

    /// Replace the whole table
    pub fn set_thresholds(&self, thresholds: Vec<MetricThreshold>) {
        let count = thresholds.len();
        self.table.store(Arc::new(thresholds));
        tracing::info!(count, "Updated metric thresholds");
    }

    /// Owned copy of the current table
    pub fn get_thresholds(&self) -> Vec<MetricThreshold> {
        self.table.load().as_ref().clone()
    }

    /// Compare `metric` against the first threshold for its type
    pub fn evaluate(&self, metric: &MetricRecord) -> Option<ThresholdBreach> {
        let table = self.table.load();
        let threshold = table.iter().find(|t| t.metric_type == metric.metric_type)?;

        let severity = if metric.value >= threshold.critical_threshold {
            Severity::Critical
        } else if metric.value >= threshold.warning_threshold {
            Severity::Warning
        } else {
            return None;
        };

        Some(ThresholdBreach {
            severity,
            threshold: threshold.clone(),
            metric: metric.clone(),
        })
    }
}

impl Default for ThresholdMonitor {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(value: f64) -> MetricRecord {
        MetricRecord::new(MetricType::Cpu, value, "%")
    }

    #[test]
    fn test_critical_breach_message() {
        let monitor = ThresholdMonitor::default();
        let breach = monitor.evaluate(&cpu(95.0)).unwrap();
        assert_eq!(breach.severity, Severity::Critical);

        let log = breach.to_log();
        assert_eq!(log.level, LogLevel::Error);
        assert_eq!(log.context.as_deref(), Some(THRESHOLD_LOG_CONTEXT));
        assert_eq!(
            log.message.render(),
            "CRITICAL THRESHOLD EXCEEDED: cpu = 95% (threshold: 90%)"
        );
    }

    #[test]
    fn test_warning_breach() {
        let monitor = ThresholdMonitor::default();
        let breach = monitor.evaluate(&cpu(75.0)).unwrap();
        assert_eq!(breach.severity, Severity::Warning);
        assert_eq!(breach.to_log().level, LogLevel::Warn);
        assert!(breach.message().starts_with("Warning threshold exceeded: cpu = 75%"));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let monitor = ThresholdMonitor::default();
        assert_eq!(monitor.evaluate(&cpu(90.0)).unwrap().severity, Severity::Critical);
        assert_eq!(monitor.evaluate(&cpu(70.0)).unwrap().severity, Severity::Warning);
        assert!(monitor.evaluate(&cpu(69.9)).is_none());
    }

    #[test]
    fn test_unlisted_type_never_breaches() {
        let monitor = ThresholdMonitor::default();
        let sample = MetricRecord::new(MetricType::QueueSize, 1e9, "");
        assert!(monitor.evaluate(&sample).is_none());
    }

    #[test]
    fn test_set_replaces_whole_table() {
        let monitor = ThresholdMonitor::default();
        monitor.set_thresholds(vec![MetricThreshold::new(MetricType::QueueSize, 10.0, 20.0)]);

        assert!(monitor.evaluate(&cpu(99.0)).is_none());
        assert_eq!(monitor.get_thresholds().len(), 1);

        // Returned table is a copy
        let mut copy = monitor.get_thresholds();
        copy.clear();
        assert_eq!(monitor.get_thresholds().len(), 1);
    }

    #[test]
    fn test_threshold_wire_format() {
        let parsed: MetricThreshold = serde_json::from_value(json!({
            "type": "memory",
            "warningThreshold": 60,
            "criticalThreshold": 80
        }))
        .unwrap();
        assert_eq!(parsed, MetricThreshold::new(MetricType::Memory, 60.0, 80.0));
    }
}
