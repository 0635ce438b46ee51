use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use nutups_lib::sink::LogSink;
use nutups_lib::{Config, NutServer, UpsMonitor};

#[derive(Parser, Debug)]
#[command(name = "nutups", version, about = "USB-HID UPS monitor with a NUT network server")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force the simulation transport (no hardware required).
    #[arg(short, long)]
    simulate: bool,

    /// Enable debug logging (same as RUST_LOG=debug).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if args.simulate {
        config.simulation_mode = true;
    }
    config.validate().context("invalid configuration")?;

    info!("nutups {} starting", env!("CARGO_PKG_VERSION"));
    info!("  UPS name        : {}", config.ups.name);
    info!("  NUT port        : {}", config.nut.port);
    info!("  Update interval : {} ms", config.update_interval_ms);
    info!("  Simulation mode : {}", config.simulation_mode);
    info!(
        "  Authentication  : {}",
        if config.nut.password.is_empty() {
            "disabled"
        } else {
            "enabled"
        }
    );

    let monitor = Arc::new(UpsMonitor::new(config.clone()));
    monitor.register_sink(Arc::new(LogSink));
    monitor.setup().await.context("transport setup failed")?;

    let server = NutServer::new(&config, Arc::clone(&monitor) as _);

    let monitor_task = tokio::spawn(Arc::clone(&monitor).run());
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("shutdown requested");

    monitor_task.abort();
    server_task.abort();
    monitor.teardown().await;

    info!("nutups stopped");
    Ok(())
}
