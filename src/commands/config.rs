use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use telemetry_bus::config::{self, Config};
use tracing::info;

/// Execute the config show command
///
/// Prints the effective configuration (file, environment and defaults merged)
pub fn show(config_path: Option<&Path>) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(config_path)?;

    println!("{}", "Current Configuration:".green().bold());
    println!();
    println!("{}", toml::to_string_pretty(&cfg)?);

    Ok(())
}

/// Execute the config validate command
pub fn validate(config_path: Option<&Path>) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    for line in summary(&cfg) {
        println!("  {}", line);
    }

    Ok(())
}

fn summary(cfg: &Config) -> Vec<String> {
    vec![
        format!("Listen: {}:{}", cfg.server.host, cfg.server.port),
        format!("Database: {}", cfg.storage.database_url),
        format!("Retention: {} days", cfg.storage.retention_days),
        format!("Subscriber capacity: {}", cfg.bus.subscriber_capacity),
        format!("Thresholds: {}", cfg.thresholds.len()),
        format!(
            "Log files: {}",
            if cfg.logging.file_enabled {
                format!("{} ({})", cfg.logging.dir.display(), cfg.logging.rotation)
            } else {
                "disabled".to_string()
            }
        ),
        format!(
            "Collector: {}",
            if cfg.collector.enabled {
                format!("every {}s", cfg.collector.interval_secs)
            } else {
                "disabled".to_string()
            }
        ),
    ]
}
