//! mqttsrv - scriptable MQTT server.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use giztoy_mqttsrv::{BrokerService, FuncRegistry, Handlers, RumqttdFactory, Settings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Scriptable MQTT server.
///
/// Listeners, limits and users are read from a YAML settings file
/// (default is ~/.giztoy/mqttsrv/config.yaml). Without a file the server
/// listens on 0.0.0.0:1883.
#[derive(Parser)]
#[command(name = "mqttsrv")]
#[command(about = "Scriptable MQTT server")]
#[command(version)]
struct Cli {
    /// Settings file (default is ~/.giztoy/mqttsrv/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("load settings")?;
    let handlers = Handlers::from_settings(&settings);
    let service = BrokerService::new(settings, &RumqttdFactory, handlers);

    let host = FuncRegistry::new();
    let _broker = service.start(&host).await.context("start MQTT server")?;
    info!(funcs = ?host.names(), "script functions registered");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
