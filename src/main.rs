//! QRScan - QR code scanner with a persistent scan history
//!
//! This is the main entry point for the qrscan command.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qrscan::cli::{Cli, CliHandler};
use qrscan::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("qrscan={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("QRScan v{}", qrscan::VERSION);

    let mut handler = CliHandler::new(config, cli.config, cli.verify);
    handler.handle_command(cli.command).await?;

    Ok(())
}
