//! Logs query command
//!
//! Query and display log records straight from the store.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use std::collections::HashSet;
use std::path::Path;
use telemetry_bus::observability::filter::LogFilterParams;
use telemetry_bus::observability::{EventStore, LogFilter, LogLevel, LogRecord, SqliteStore};

use super::{open_store, since_seconds};

/// Query and display logs
#[derive(Debug, Clone, Parser)]
pub struct LogsArgs {
    /// Minimum level (DEBUG, INFO, LOG, WARN, ERROR or 0-4)
    #[arg(short, long)]
    pub level: Option<String>,

    /// Maximum level
    #[arg(long)]
    pub max_level: Option<String>,

    /// Comma separated contexts
    #[arg(long)]
    pub context: Option<String>,

    /// Case-insensitive regular expression over the message
    #[arg(short, long)]
    pub pattern: Option<String>,

    /// Show logs since N seconds ago (e.g., 3600 for last hour)
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

    /// Keep polling for new records (tail -f mode)
    #[arg(long)]
    pub follow: bool,
}

impl LogsArgs {
    fn to_filter(&self) -> LogFilter {
        let mut filter = LogFilterParams {
            level: self.level.clone(),
            max_level: self.max_level.clone(),
            context: self.context.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            pattern: self.pattern.clone(),
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

/// Execute the logs command
pub async fn execute(args: LogsArgs, config_path: Option<&Path>) -> Result<()> {
    let store = open_store(config_path).await?;
    let filter = args.to_filter();

    if args.follow {
        return follow_logs(&store, filter).await;
    }

    let logs: Vec<LogRecord> = store.query(&filter).await?;

    if logs.is_empty() {
        println!("{}", "No logs found matching the criteria".yellow());
        return Ok(());
    }

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&logs)?),
        _ => {
            println!("{}", format!("Found {} log records", logs.len()).bold());
            println!();
            for log in &logs {
                print_log(log);
            }
        }
    }

    Ok(())
}

fn colored_level(level: LogLevel) -> colored::ColoredString {
    let name = level.as_str();
    match level {
        LogLevel::Error => name.red().bold(),
        LogLevel::Warn => name.yellow().bold(),
        LogLevel::Info | LogLevel::Log => name.green(),
        LogLevel::Debug => name.blue(),
    }
}

fn print_log(log: &LogRecord) {
    let timestamp = log
        .timestamp
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_default();

    let audit = log
        .audit
        .as_ref()
        .map(|a| {
            format!(
                " [audit user={} action={}]",
                a.user_id.as_deref().unwrap_or("-"),
                a.action.as_deref().unwrap_or("-")
            )
        })
        .unwrap_or_default();

    println!(
        "{} {} {}{} {}",
        timestamp.dimmed(),
        colored_level(log.level),
        log.context.as_deref().unwrap_or("-").cyan(),
        audit.magenta(),
        log.message.render()
    );

    if let Some(info) = &log.additional_info {
        println!("  {}", format!("info: {}", info).dimmed());
    }
}

/// Poll the store for new records (tail -f mode)
async fn follow_logs(store: &SqliteStore, mut filter: LogFilter) -> Result<()> {
    use tokio::time::{interval, Duration};

    println!("{}", "Following logs (Ctrl+C to stop)...".bold());
    println!();

    filter.from = Some(chrono::Utc::now());
    filter.limit = None;
    let mut seen_at_cursor: HashSet<String> = HashSet::new();
    let mut poll_interval = interval(Duration::from_millis(500));

    loop {
        poll_interval.tick().await;

        let mut logs: Vec<LogRecord> = store.query(&filter).await?;
        // Oldest first for display
        logs.reverse();

        for log in logs {
            let id = log.id.clone().unwrap_or_default();
            if seen_at_cursor.contains(&id) {
                continue;
            }
            if log.timestamp != filter.from {
                seen_at_cursor.clear();
                filter.from = log.timestamp;
            }
            seen_at_cursor.insert(id);
            print_log(&log);
        }
    }
}
