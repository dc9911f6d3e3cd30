//! Filter predicates shared by live subscriptions and store queries
//!
//! A filter is a conjunction of optional criteria. An absent criterion does
//! not constrain; a present criterion fails when the record lacks the field it
//! inspects. The same `matches` runs on the publish path and as the final pass
//! of every store query, so a historical query returns exactly what a live
//! subscriber with the same filter would have received.

use chrono::{DateTime, NaiveDate, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::record::{LogLevel, LogRecord, MetricRecord, MetricType};

/// Predicate over one record kind
pub trait RecordFilter<R> {
    fn matches(&self, record: &R) -> bool;

    /// Maximum number of results for store queries; ignored by live delivery
    fn limit(&self) -> Option<usize> {
        None
    }
}

fn in_window(
    timestamp: Option<DateTime<Utc>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    if from.is_none() && to.is_none() {
        return true;
    }
    let Some(ts) = timestamp else {
        return false;
    };
    from.map_or(true, |from| ts >= from) && to.map_or(true, |to| ts <= to)
}

// ============================================================================
// Log filter
// ============================================================================

/// Filter for log records
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Inclusive lower level bound
    pub min_level: Option<LogLevel>,

    /// Inclusive upper level bound
    pub max_level: Option<LogLevel>,

    /// Allowed contexts (exact match); empty means unconstrained
    pub contexts: Vec<String>,

    /// Case-insensitive pattern searched in the rendered message
    pub pattern: Option<Regex>,

    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,

    /// Maximum number of results (store queries only)
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn min_level(level: LogLevel) -> Self {
        Self {
            min_level: Some(level),
            ..Default::default()
        }
    }

    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the message pattern. Fails on an invalid expression.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.pattern = Some(compile_pattern(pattern)?);
        Ok(self)
    }
}

impl RecordFilter<LogRecord> for LogFilter {
    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(min) = self.min_level {
            if record.level < min {
                return false;
            }
        }
        if let Some(max) = self.max_level {
            if record.level > max {
                return false;
            }
        }

        if !self.contexts.is_empty() {
            match &record.context {
                Some(ctx) if self.contexts.iter().any(|c| c == ctx) => {}
                _ => return false,
            }
        }

        if !in_window(record.timestamp, self.from, self.to) {
            return false;
        }

        if let Some(pattern) = &self.pattern {
            if record.message.is_empty() || !pattern.is_match(&record.message.render()) {
                return false;
            }
        }

        true
    }

    fn limit(&self) -> Option<usize> {
        self.limit
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

// ============================================================================
// Metric filter
// ============================================================================

/// Filter for metric samples
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    /// Allowed metric kinds; empty means unconstrained
    pub types: Vec<MetricType>,

    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,

    pub min_value: Option<f64>,
    pub max_value: Option<f64>,

    /// Tags that must all be present with equal values
    pub tags: BTreeMap<String, String>,

    /// Maximum number of results (store queries only)
    pub limit: Option<usize>,
}

impl MetricFilter {
    pub fn types<I: IntoIterator<Item = MetricType>>(types: I) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl RecordFilter<MetricRecord> for MetricFilter {
    fn matches(&self, record: &MetricRecord) -> bool {
        if !self.types.is_empty() && !self.types.contains(&record.metric_type) {
            return false;
        }

        if !in_window(record.timestamp, self.from, self.to) {
            return false;
        }

        if let Some(min) = self.min_value {
            if !(record.value >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_value {
            if !(record.value <= max) {
                return false;
            }
        }

        self.tags
            .iter()
            .all(|(key, value)| record.tags.get(key) == Some(value))
    }

    fn limit(&self) -> Option<usize> {
        self.limit
    }
}

// ============================================================================
// Lenient wire parameters
// ============================================================================

/// Parse an ISO-8601 / RFC 3339 instant; a bare date means midnight UTC
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn lenient<T>(name: &str, raw: &Option<String>, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let value = non_empty(raw)?;
    let parsed = parse(value);
    if parsed.is_none() {
        tracing::debug!(param = name, value = value, "Ignoring invalid filter parameter");
    }
    parsed
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Log filter as received over HTTP query strings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterParams {
    /// Minimum level (0..4 or a name)
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub max_level: Option<String>,
    /// Comma separated context list
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

impl LogFilterParams {
    /// Convert without failing: invalid values leave their dimension open
    pub fn into_filter(self) -> LogFilter {
        let contexts = non_empty(&self.context)
            .map(|raw| split_list(raw).map(str::to_string).collect())
            .unwrap_or_default();

        LogFilter {
            min_level: lenient("level", &self.level, |s| s.parse().ok()),
            max_level: lenient("maxLevel", &self.max_level, |s| s.parse().ok()),
            contexts,
            pattern: lenient("pattern", &self.pattern, |s| compile_pattern(s).ok()),
            from: lenient("from", &self.from, parse_instant),
            to: lenient("to", &self.to, parse_instant),
            limit: lenient("limit", &self.limit, |s| s.parse().ok()),
        }
    }
}

/// Metric filter as received over HTTP query strings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricFilterParams {
    /// Comma separated metric type list
    #[serde(default, rename = "type")]
    pub types: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub min_value: Option<String>,
    #[serde(default)]
    pub max_value: Option<String>,
    /// Comma separated `key:value` pairs
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

impl MetricFilterParams {
    pub fn into_filter(self) -> MetricFilter {
        let types = non_empty(&self.types)
            .map(|raw| parse_types(split_list(raw)))
            .unwrap_or_default();

        let tags = non_empty(&self.tags)
            .map(|raw| {
                split_list(raw)
                    .filter_map(|pair| match pair.split_once(':') {
                        Some((k, v)) if !k.trim().is_empty() => {
                            Some((k.trim().to_string(), v.trim().to_string()))
                        }
                        _ => {
                            tracing::debug!(pair = pair, "Ignoring malformed tag filter");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        MetricFilter {
            types,
            from: lenient("from", &self.from, parse_instant),
            to: lenient("to", &self.to, parse_instant),
            min_value: lenient("minValue", &self.min_value, parse_finite),
            max_value: lenient("maxValue", &self.max_value, parse_finite),
            tags,
            limit: lenient("limit", &self.limit, |s| s.parse().ok()),
        }
    }
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_types<'a>(names: impl Iterator<Item = &'a str>) -> Vec<MetricType> {
    names
        .filter_map(|name| match name.parse::<MetricType>() {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unknown metric type in filter");
                None
            }
        })
        .collect()
}

/// Metric filter as carried in WebSocket messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricFilterMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, alias = "from", skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,
    #[serde(default, alias = "to", skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MetricFilterMessage {
    pub fn into_filter(self) -> MetricFilter {
        MetricFilter {
            types: parse_types(self.types.iter().map(String::as_str)),
            from: lenient("fromDate", &self.from_date, parse_instant),
            to: lenient("toDate", &self.to_date, parse_instant),
            min_value: self.min_value.filter(|v| v.is_finite()),
            max_value: self.max_value.filter(|v| v.is_finite()),
            tags: self.tags,
            limit: None,
        }
    }
}
