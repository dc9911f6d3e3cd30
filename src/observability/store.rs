//! Durable store for published records
//!
//! SQLite through sqlx with:
//! - Connection pooling and WAL mode
//! - Embedded migrations
//! - Insert-only batch appends (duplicate ids are ignored, never overwritten)
//! - Index-assisted queries followed by the in-memory filter pass

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::filter::{LogFilter, MetricFilter, RecordFilter};
use super::record::{AuditInfo, BusRecord, LogLevel, LogRecord, MetricRecord, MetricType, Payload};

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {id}")]
    NotFound { id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Persistence contract for one record kind
#[async_trait]
pub trait EventStore<R: BusRecord>: Send + Sync {
    /// Insert records; returns how many rows were actually written
    async fn append_batch(&self, records: &[Arc<R>]) -> Result<u64, StoreError>;

    /// Matching records, newest first
    async fn query(&self, filter: &R::Filter) -> Result<Vec<R>, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<R, StoreError>;
}

/// Row counts per table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub log_count: u64,
    pub audit_count: u64,
    pub metric_count: u64,
}

/// Rows removed by a retention pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    pub logs_deleted: u64,
    pub metrics_deleted: u64,
}

/// SQLite-backed store for logs and metrics
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database and run migrations
    ///
    /// ```ignore
    /// let store = SqliteStore::connect("sqlite:./data/telemetry.db").await?;
    /// ```
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "memory")
            .pragma("synchronous", "NORMAL");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30));

        // An in-memory database lives only as long as its connection
        if database_url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(database_url = %database_url, "Store migrations completed");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Override the TTL of one table ("logs" or "metrics")
    pub async fn set_retention(&self, table: &str, ttl_days: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE retention_policy SET ttl_days = ? WHERE table_name = ?")
            .bind(ttl_days as i64)
            .bind(table)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let log_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        let audit_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs WHERE is_audit = 1")
            .fetch_one(&self.pool)
            .await?;
        let metric_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            log_count: log_count as u64,
            audit_count: audit_count as u64,
            metric_count: metric_count as u64,
        })
    }

    /// Delete rows older than each table's TTL
    pub async fn cleanup_expired(&self) -> Result<CleanupStats, StoreError> {
        let mut tx = self.pool.begin().await?;

        let policies: Vec<(String, i64)> =
            sqlx::query_as("SELECT table_name, ttl_days FROM retention_policy")
                .fetch_all(&mut *tx)
                .await?;

        let now = Utc::now().timestamp_millis();
        let mut stats = CleanupStats::default();

        for (table_name, ttl_days) in policies {
            let cutoff = now - ttl_days * 24 * 60 * 60 * 1000;

            let deleted = match table_name.as_str() {
                "logs" => {
                    let result = sqlx::query("DELETE FROM logs WHERE timestamp < ?")
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?;
                    stats.logs_deleted = result.rows_affected();
                    result.rows_affected()
                }
                "metrics" => {
                    let result = sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?;
                    stats.metrics_deleted = result.rows_affected();
                    result.rows_affected()
                }
                _ => 0,
            };

            tracing::info!(table = %table_name, ttl_days, deleted, "Cleaned up expired records");

            sqlx::query("UPDATE retention_policy SET last_cleanup = ? WHERE table_name = ?")
                .bind(now)
                .bind(&table_name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        // VACUUM cannot run inside a transaction
        sqlx::query("VACUUM").execute(&self.pool).await?;

        Ok(stats)
    }
}

/// Id and millisecond timestamp for a row; unstamped records get fresh values
fn row_key<R: BusRecord>(record: &R) -> (String, i64) {
    let id = record
        .id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ts = record.timestamp().unwrap_or_else(Utc::now).timestamp_millis();
    (id, ts)
}

fn decode_timestamp(id: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp out of range: {}", millis),
    })
}

/// Newest first, ties broken by insertion order
const ORDER_NEWEST_FIRST: &str = " ORDER BY timestamp DESC, rowid DESC";

fn finish<R, F: RecordFilter<R>>(rows: Vec<R>, filter: &F) -> Vec<R> {
    let matched = rows.into_iter().filter(|r| filter.matches(r));
    match filter.limit() {
        Some(limit) => matched.take(limit).collect(),
        None => matched.collect(),
    }
}

// ============================================================================
// Logs
// ============================================================================

const LOG_COLUMNS: &str = "id, timestamp, level, context, message, additional_info, is_audit, \
                           user_id, session_id, origin, resource_id, action, status";

fn decode_log(row: &SqliteRow) -> Result<LogRecord, StoreError> {
    let id: String = row.try_get("id")?;

    let level_raw: i64 = row.try_get("level")?;
    let level = u8::try_from(level_raw)
        .ok()
        .and_then(LogLevel::from_u8)
        .ok_or_else(|| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("invalid level: {}", level_raw),
        })?;

    let message: Payload = serde_json::from_str(&row.try_get::<String, _>("message")?)?;
    let additional_info = row
        .try_get::<Option<String>, _>("additional_info")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    let audit = if row.try_get::<i64, _>("is_audit")? != 0 {
        Some(AuditInfo {
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            origin: row.try_get("origin")?,
            resource_id: row.try_get("resource_id")?,
            action: row.try_get("action")?,
            status: row
                .try_get::<Option<String>, _>("status")?
                .and_then(|s| s.parse().ok()),
        })
    } else {
        None
    };

    let timestamp = decode_timestamp(&id, row.try_get("timestamp")?)?;

    Ok(LogRecord {
        id: Some(id),
        timestamp: Some(timestamp),
        level,
        message,
        context: row.try_get("context")?,
        additional_info,
        audit,
    })
}

fn push_log_predicates(qb: &mut QueryBuilder<'_, Sqlite>, filter: &LogFilter) {
    if let Some(min) = filter.min_level {
        qb.push(" AND level >= ").push_bind(min.as_u8() as i64);
    }
    if let Some(max) = filter.max_level {
        qb.push(" AND level <= ").push_bind(max.as_u8() as i64);
    }
    if !filter.contexts.is_empty() {
        qb.push(" AND context IN (");
        let mut separated = qb.separated(", ");
        for ctx in &filter.contexts {
            separated.push_bind(ctx.clone());
        }
        separated.push_unseparated(")");
    }
    if let Some(from) = filter.from {
        qb.push(" AND timestamp >= ").push_bind(from.timestamp_millis());
    }
    if let Some(to) = filter.to {
        qb.push(" AND timestamp <= ").push_bind(to.timestamp_millis());
    }
}

#[async_trait]
impl EventStore<LogRecord> for SqliteStore {
    async fn append_batch(&self, records: &[Arc<LogRecord>]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let (id, ts) = row_key(record.as_ref());
            let message = serde_json::to_string(&record.message)?;
            let additional_info = record
                .additional_info
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let audit = record.audit.as_ref();

            let result = sqlx::query(
                "INSERT INTO logs (id, timestamp, level, context, message, additional_info, is_audit,
                                   user_id, session_id, origin, resource_id, action, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&id)
            .bind(ts)
            .bind(record.level.as_u8() as i64)
            .bind(&record.context)
            .bind(&message)
            .bind(&additional_info)
            .bind(audit.is_some() as i64)
            .bind(audit.and_then(|a| a.user_id.clone()))
            .bind(audit.and_then(|a| a.session_id.clone()))
            .bind(audit.and_then(|a| a.origin.clone()))
            .bind(audit.and_then(|a| a.resource_id.clone()))
            .bind(audit.and_then(|a| a.action.clone()))
            .bind(audit.and_then(|a| a.status.map(|s| s.as_str())))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tracing::warn!(id = %id, "Duplicate log id ignored");
            }
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM logs WHERE 1=1", LOG_COLUMNS));
        push_log_predicates(&mut qb, filter);
        qb.push(ORDER_NEWEST_FIRST);

        // The pattern is evaluated in memory, so the row limit only applies without one
        if let (Some(limit), None) = (filter.limit, &filter.pattern) {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let records = rows.iter().map(decode_log).collect::<Result<Vec<_>, _>>()?;

        Ok(finish(records, filter))
    }

    async fn get_by_id(&self, id: &str) -> Result<LogRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM logs WHERE id = ?", LOG_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        decode_log(&row)
    }
}

// ============================================================================
// Metrics
// ============================================================================

const METRIC_COLUMNS: &str = "id, timestamp, type, value, unit, host, tags";

fn decode_metric(row: &SqliteRow) -> Result<MetricRecord, StoreError> {
    let id: String = row.try_get("id")?;

    let type_raw: String = row.try_get("type")?;
    let metric_type = MetricType::from_str(&type_raw).map_err(|reason| StoreError::Corrupt {
        id: id.clone(),
        reason,
    })?;
    let tags: BTreeMap<String, String> = serde_json::from_str(&row.try_get::<String, _>("tags")?)?;
    let timestamp = decode_timestamp(&id, row.try_get("timestamp")?)?;

    Ok(MetricRecord {
        id: Some(id),
        timestamp: Some(timestamp),
        metric_type,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        host: row.try_get("host")?,
        tags,
    })
}

fn push_metric_predicates(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MetricFilter) {
    if !filter.types.is_empty() {
        qb.push(" AND type IN (");
        let mut separated = qb.separated(", ");
        for t in &filter.types {
            separated.push_bind(t.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(from) = filter.from {
        qb.push(" AND timestamp >= ").push_bind(from.timestamp_millis());
    }
    if let Some(to) = filter.to {
        qb.push(" AND timestamp <= ").push_bind(to.timestamp_millis());
    }
    if let Some(min) = filter.min_value {
        qb.push(" AND value >= ").push_bind(min);
    }
    if let Some(max) = filter.max_value {
        qb.push(" AND value <= ").push_bind(max);
    }
    for (key, value) in &filter.tags {
        qb.push(" AND json_extract(tags, ")
            .push_bind(format!("$.\"{}\"", key.replace('"', "\\\"")))
            .push(") = ")
            .push_bind(value.clone());
    }
}

#[async_trait]
impl EventStore<MetricRecord> for SqliteStore {
    async fn append_batch(&self, records: &[Arc<MetricRecord>]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let (id, ts) = row_key(record.as_ref());
            let tags = serde_json::to_string(&record.tags)?;

            let result = sqlx::query(
                "INSERT INTO metrics (id, timestamp, type, value, unit, host, tags)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&id)
            .bind(ts)
            .bind(record.metric_type.as_str())
            .bind(record.value)
            .bind(&record.unit)
            .bind(&record.host)
            .bind(&tags)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tracing::warn!(id = %id, "Duplicate metric id ignored");
            }
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn query(&self, filter: &MetricFilter) -> Result<Vec<MetricRecord>, StoreError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM metrics WHERE 1=1", METRIC_COLUMNS));
        push_metric_predicates(&mut qb, filter);
        qb.push(ORDER_NEWEST_FIRST);
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let records = rows.iter().map(decode_metric).collect::<Result<Vec<_>, _>>()?;

        Ok(finish(records, filter))
    }

    async fn get_by_id(&self, id: &str) -> Result<MetricRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM metrics WHERE id = ?", METRIC_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        decode_metric(&row)
    }
}
