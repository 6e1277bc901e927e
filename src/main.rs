//! CLI Entry Point for rig_daq
//!
//! Provides command-line interface for:
//! - Serving the HTTP control plane for dashboards
//! - Listing attached rigs
//!
//! # Usage
//!
//! ```bash
//! rig_daq serve --config config/rig_daq.toml --bind 0.0.0.0:6229
//! rig_daq ports
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rig_daq::config::{RigConfig, DEFAULT_CONFIG_PATH};
use rig_daq::serial::PortListing;
use rig_daq::{http, logging, RigController, RigError};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rig_daq")]
#[command(about = "Serial controller and HTTP control plane for behavioral rigs", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control plane until Ctrl-C
    Serve {
        /// Listen address, overriding `http.bind`
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Print attached serial devices
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate().map_err(RigError::Configuration)?;
    logging::init_from_config(&config).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::Ports => list_ports(config).await,
    }
}

async fn serve(config: RigConfig, bind: Option<SocketAddr>) -> Result<()> {
    let addr = bind.unwrap_or(config.http.bind);
    let controller = RigController::new(config);

    tracing::info!(%addr, "Starting rig_daq");
    http::serve(controller.clone(), addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
    })
    .await
    .context("HTTP server failed")?;

    controller.shutdown().await;
    Ok(())
}

async fn list_ports(config: RigConfig) -> Result<()> {
    let controller = RigController::new(config);
    let devices = controller.list_devices()?;
    if devices.is_empty() {
        println!("{}", PortListing::NoPorts);
    }
    for device in devices {
        println!(
            "{}\t{:04x}:{:04x}\t{}",
            device.name,
            device.vid,
            device.pid,
            device.product.as_deref().unwrap_or("-")
        );
    }
    controller.shutdown().await;
    Ok(())
}
