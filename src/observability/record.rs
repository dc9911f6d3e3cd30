//! Event record model
//!
//! The canonical shapes flowing through the buses:
//! - [`LogRecord`]: a structured log line, optionally flagged as an audit entry
//! - [`MetricRecord`]: a numeric sample of a closed set of metric kinds
//!
//! Both implement [`BusRecord`], which is what the live bus, the writer and
//! the store are generic over.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::filter::{LogFilter, MetricFilter, RecordFilter};

/// Common behavior of everything that can be published on a bus
pub trait BusRecord: Clone + Send + Sync + fmt::Debug + 'static {
    /// Per-subscriber / per-query matching criteria for this record kind
    type Filter: RecordFilter<Self> + Clone + Default + Send + Sync + fmt::Debug + 'static;

    /// Short name used in log fields and metric labels ("log", "metric")
    const KIND: &'static str;

    fn id(&self) -> Option<&str>;

    fn timestamp(&self) -> Option<DateTime<Utc>>;

    /// Assign id and timestamp when absent. A supplied id is kept as is; a
    /// supplied timestamp is only cut down to the millisecond precision the
    /// store keeps, so live and stored copies compare the same.
    fn stamp(&mut self);
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time at the millisecond precision the store keeps
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ============================================================================
// Payload
// ============================================================================

/// Message payload of a log record
///
/// Serialized adjacently tagged so every variant survives a JSON round trip,
/// including structured values that happen to look like an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Numeric(f64),
    Structured(serde_json::Value),
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
}

impl Payload {
    /// Map an arbitrary incoming JSON value onto a payload variant
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Payload::Empty,
            serde_json::Value::String(s) => Payload::Text(s),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Payload::Numeric(f),
                None => Payload::Structured(serde_json::Value::Number(n)),
            },
            other => Payload::Structured(other),
        }
    }

    pub fn error(message: impl Into<String>, trace: Option<String>) -> Self {
        Payload::Error {
            message: message.into(),
            trace,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    /// Deterministic text form used for pattern matching and console output
    ///
    /// Structured values are serialized compactly with sorted object keys.
    pub fn render(&self) -> String {
        match self {
            Payload::Empty => String::new(),
            Payload::Text(s) => s.clone(),
            Payload::Numeric(n) => n.to_string(),
            Payload::Structured(v) => serde_json::to_string(v).unwrap_or_default(),
            Payload::Error { message, trace } => match trace {
                Some(trace) => format!("{}\n{}", message, trace),
                None => message.clone(),
            },
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<f64> for Payload {
    fn from(n: f64) -> Self {
        Payload::Numeric(n)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::from_json(v)
    }
}

// ============================================================================
// Log level
// ============================================================================

/// Ordered log severity, DEBUG < INFO < LOG < WARN < ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Log = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Log,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Log => "LOG",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts `0`..`4` or a case-insensitive level name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<u8>() {
            return Self::from_u8(n).ok_or_else(|| format!("log level out of range: {}", n));
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "LOG" => Ok(LogLevel::Log),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => LogLevel::from_u8(n)
                .ok_or_else(|| serde::de::Error::custom(format!("log level out of range: {}", n))),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ============================================================================
// Log record
// ============================================================================

/// Outcome recorded on an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Attempted,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
            AuditStatus::Attempted => "attempted",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditStatus::Success),
            "failure" => Ok(AuditStatus::Failure),
            "attempted" => Ok(AuditStatus::Attempted),
            other => Err(format!("unknown audit status: {}", other)),
        }
    }
}

/// Compliance metadata carried by audit entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AuditStatus>,
}

/// A single log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub level: LogLevel,
    #[serde(default)]
    pub message: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
    /// Present only on entries explicitly written to the audit trail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditInfo>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<Payload>) -> Self {
        Self {
            id: None,
            timestamp: None,
            level,
            message: message.into(),
            context: None,
            additional_info: None,
            audit: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_additional_info(mut self, info: serde_json::Value) -> Self {
        self.additional_info = Some(info);
        self
    }

    pub fn with_audit(mut self, audit: AuditInfo) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_audit(&self) -> bool {
        self.audit.is_some()
    }
}

impl BusRecord for LogRecord {
    type Filter = LogFilter;
    const KIND: &'static str = "log";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    fn stamp(&mut self) {
        if self.id.is_none() {
            self.id = Some(new_id());
        }
        self.timestamp = Some(self.timestamp.map_or_else(now_millis, |ts| ts.trunc_subsecs(3)));
    }
}

// ============================================================================
// Metric record
// ============================================================================

/// Closed set of metric kinds (unordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    RequestRate,
    QueueSize,
    ActiveUsers,
    DiskIo,
    NetworkIo,
    Cpu,
    Memory,
    ResponseTime,
    ErrorRate,
    MemoryUsed,
}

impl MetricType {
    pub const ALL: [MetricType; 10] = [
        MetricType::RequestRate,
        MetricType::QueueSize,
        MetricType::ActiveUsers,
        MetricType::DiskIo,
        MetricType::NetworkIo,
        MetricType::Cpu,
        MetricType::Memory,
        MetricType::ResponseTime,
        MetricType::ErrorRate,
        MetricType::MemoryUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::RequestRate => "request_rate",
            MetricType::QueueSize => "queue_size",
            MetricType::ActiveUsers => "active_users",
            MetricType::DiskIo => "disk_io",
            MetricType::NetworkIo => "network_io",
            MetricType::Cpu => "cpu",
            MetricType::Memory => "memory",
            MetricType::ResponseTime => "response_time",
            MetricType::ErrorRate => "error_rate",
            MetricType::MemoryUsed => "memory_used",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown metric type: {}", s))
    }
}

/// A single metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(metric_type: MetricType, value: f64, unit: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: None,
            metric_type,
            value,
            unit: unit.into(),
            host: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl BusRecord for MetricRecord {
    type Filter = MetricFilter;
    const KIND: &'static str = "metric";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    fn stamp(&mut self) {
        if self.id.is_none() {
            self.id = Some(new_id());
        }
        self.timestamp = Some(self.timestamp.map_or_else(now_millis, |ts| ts.trunc_subsecs(3)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_from_json() {
        assert_eq!(Payload::from_json(json!(null)), Payload::Empty);
        assert_eq!(Payload::from_json(json!("hi")), Payload::Text("hi".to_string()));
        assert_eq!(Payload::from_json(json!(42)), Payload::Numeric(42.0));
        assert_eq!(
            Payload::from_json(json!({"a": 1})),
            Payload::Structured(json!({"a": 1}))
        );
    }

    #[test]
    fn test_structured_payload_keeps_shape_through_json() {
        // An object that looks like an error must stay structured
        let payload = Payload::Structured(json!({"message": "boom", "trace": "x"}));
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);

        let err = Payload::error("boom", Some("at main".to_string()));
        let decoded: Payload = serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_payload_render_is_deterministic() {
        let a = Payload::Structured(json!({"b": 2, "a": 1}));
        let b = Payload::Structured(json!({"a": 1, "b": 2}));
        assert_eq!(a.render(), b.render());
        assert_eq!(a.render(), r#"{"a":1,"b":2}"#);

        let err = Payload::error("failed", Some("stack".to_string()));
        assert_eq!(err.render(), "failed\nstack");
        assert_eq!(Payload::Empty.render(), "");
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("0".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("4".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert!("5".parse::<LogLevel>().is_err());
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Info && LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_log_level_serde_accepts_numbers_and_names() {
        let level: LogLevel = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(level, LogLevel::Warn);
        let level: LogLevel = serde_json::from_value(json!("error")).unwrap();
        assert_eq!(level, LogLevel::Error);
        assert_eq!(serde_json::to_value(LogLevel::Log).unwrap(), json!("LOG"));
    }

    #[test]
    fn test_stamp_fills_only_missing_fields() {
        let mut record = LogRecord::new(LogLevel::Info, "hello");
        record.stamp();
        let id = record.id.clone().unwrap();
        let ts = record.timestamp.unwrap();

        record.stamp();
        assert_eq!(record.id.as_deref(), Some(id.as_str()));
        assert_eq!(record.timestamp, Some(ts));

        let mut supplied = MetricRecord::new(MetricType::Cpu, 1.0, "%");
        supplied.id = Some("fixed".to_string());
        supplied.stamp();
        assert_eq!(supplied.id.as_deref(), Some("fixed"));
        assert!(supplied.timestamp.is_some());
    }

    #[test]
    fn test_stamp_truncates_supplied_timestamp() {
        let exact = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut record = MetricRecord::new(MetricType::Cpu, 1.0, "%").with_timestamp(exact);
        record.stamp();

        let expected = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(record.timestamp, Some(expected));
    }

    #[test]
    fn test_metric_record_wire_format() {
        let record: MetricRecord = serde_json::from_value(json!({
            "type": "response_time",
            "value": 120.5,
            "unit": "ms",
            "tags": {"route": "/api"}
        }))
        .unwrap();
        assert_eq!(record.metric_type, MetricType::ResponseTime);
        assert_eq!(record.tags.get("route").map(String::as_str), Some("/api"));
        assert!(record.id.is_none());
        assert_eq!("MEMORY_USED".parse::<MetricType>().unwrap(), MetricType::MemoryUsed);
    }
}
