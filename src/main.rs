use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windrose::config::Config;

#[derive(Parser, Debug)]
#[command(name = "windrose")]
#[command(author, version, about = "DNS-based global server load balancer", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "windrose.yaml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting windrose v{}", env!("CARGO_PKG_VERSION"));

    windrose::server::run(cli.config, config).await
}
