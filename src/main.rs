//! telemetryd - sensor telemetry daemon entry point

use clap::{Parser, Subcommand};
use homie_telemetry::config::TelemetryConfig;
use homie_telemetry::observability::{init_default_logging, LogReceiver};
use homie_telemetry::{DaemonError, TelemetryDaemon};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info};

/// Publish sensor readings as Homie properties over MQTT
#[derive(Parser)]
#[command(name = "telemetryd")]
#[command(about = "Unattended sensor telemetry daemon for Homie over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until SIGINT or SIGTERM
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The configuration decides the extra log outputs, so it is read first
    let loaded = load_configuration(cli.config.as_deref());
    let outputs = loaded
        .as_ref()
        .map(|(_, config)| config.logging.clone())
        .unwrap_or_default();
    let log_records = init_default_logging(cli.verbose, &outputs);

    info!("Starting telemetryd v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok((path, config)) => {
            info!("Loaded configuration from: {}", path.display());
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_daemon(config, log_records).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(configuration = e.is_configuration(), "Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> Result<(PathBuf, TelemetryConfig), DaemonError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => TelemetryConfig::find_config_file()?,
    };
    let config = TelemetryConfig::load_from_file(&path)?;
    Ok((path, config))
}

async fn run_daemon(
    config: TelemetryConfig,
    log_records: Option<LogReceiver>,
) -> Result<(), DaemonError> {
    info!(device = %config.device.id, link = ?config.link.kind, "Daemon starting");

    let mut daemon = TelemetryDaemon::from_config(config)?;
    if let Some(records) = log_records {
        daemon = daemon.with_log_forwarding(records);
    }

    let mut sigint =
        signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(DaemonError::Signal)?;
    let mut sigterm =
        signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(DaemonError::Signal)?;

    if let Err(e) = daemon.start().await {
        error!("Startup failed: {}", e);
        if let Err(shutdown_error) = daemon.shutdown().await {
            error!("Error during shutdown: {}", shutdown_error);
        }
        return Err(e);
    }

    info!("Daemon running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = daemon.broker_lost() => {
            error!("Broker connection permanently lost, shutting down...");
        }
    }

    daemon.shutdown().await
}

fn handle_config_command(config: &TelemetryConfig, show: bool) -> Result<(), DaemonError> {
    if show {
        match toml::to_string_pretty(config) {
            Ok(rendered) => {
                println!("Effective configuration:");
                println!("{rendered}");
            }
            Err(e) => error!("Failed to render configuration: {}", e),
        }
    }

    info!("Configuration is valid");
    Ok(())
}
