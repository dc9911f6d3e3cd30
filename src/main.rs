use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use telemetry_bus::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args.get_command();
    let config_path = args.config.as_deref();

    // The server initializes tracing from its own configuration
    if !matches!(command, cli::Commands::Start) {
        init_tracing("warn", "pretty");
    }

    match command {
        cli::Commands::Start => {
            commands::start::execute(args.config.clone()).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(config_path)?,
            cli::ConfigCommands::Validate => commands::config::validate(config_path)?,
        },
        cli::Commands::Logs(logs_args) => {
            commands::logs::execute(logs_args, config_path).await?;
        }
        cli::Commands::Metrics(metrics_args) => {
            commands::metrics::execute(metrics_args, config_path).await?;
        }
        cli::Commands::Cleanup => {
            commands::cleanup::execute(config_path).await?;
        }
        cli::Commands::Version => {
            println!("Telemetry Bus v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
