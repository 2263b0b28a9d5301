//! Gateway entry point
//!
//! Usage:
//!   gateway --config config/gateway.toml
//!   gateway --log-level debug --json-logs

use anyhow::{Context, Result};
use clap::Parser;
use gateway::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "Service gateway: registry and passthrough routing")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); GATEWAY_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gateway");

    let config = GatewayConfig::load(args.config.as_deref())
        .context("Failed to load gateway configuration")?;
    let running = Gateway::new(config)
        .context("Failed to assemble gateway")?
        .start()
        .await
        .context("Failed to start gateway")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    running.shutdown().await?;
    Ok(())
}

fn init_logging(args: &Args) {
    let level = args.log_level.to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gateway={level},passthrough={level},registry={level},warn"
        ))
    });

    let json = args.json_logs.then(|| tracing_subscriber::fmt::layer().json());
    let plain = (!args.json_logs).then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}
