mod config;
mod telemetry;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use neo_count::errors::NeoCountError;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "neo", version, about = "Near-Earth object count service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the count API until SIGINT or SIGTERM
    Serve(ConfigArgs),
    /// Create the count table if it does not exist
    Migrate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// YAML config file. Without it, defaults and environment variables are used.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl CliCommand {
    fn config_args(&self) -> &ConfigArgs {
        match self {
            CliCommand::Serve(args) | CliCommand::Migrate(args) => args,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("{0}")]
    Service(#[from] NeoCountError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is not an error
    let _ = dotenvy::dotenv();

    // Logging is not set up yet, so startup failures go to stderr
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("neo: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _sentry = match telemetry::init(&config.common) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("neo: {}", CliError::from(e));
            return ExitCode::FAILURE;
        }
    };

    match execute(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "neo exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let path = cli.command.config_args().config.as_deref();
    Ok(Config::load(path, |name| std::env::var(name).ok())?)
}

fn execute(command: CliCommand, config: Config) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        CliCommand::Serve(_) => {
            tracing::info!("Starting neo-count");
            runtime.block_on(async {
                let shutdown = CancellationToken::new();
                tokio::spawn(cancel_on_signal(shutdown.clone()));
                neo_count::run(config.neo_count, shutdown).await
            })?;
        }
        CliCommand::Migrate(_) => {
            tracing::info!("Migrating count store");
            runtime.block_on(neo_count::migrate(&config.neo_count))?;
        }
    }

    Ok(())
}

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
