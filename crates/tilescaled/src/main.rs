//! tilescaled: the tilescale daemon.
//!
//! Single binary that assembles the autoscaling subsystems:
//! - Replica pool (command orchestrator + HTTP health gate)
//! - Autoscaling controller and its control loop
//! - Request aggregator (metric source)
//! - REST API + Prometheus scrape endpoint
//!
//! # Usage
//!
//! ```text
//! tilescaled run --config /etc/tilescale/tilescale.toml --port 9090
//! tilescaled check --config /etc/tilescale/tilescale.toml
//! tilescaled --env-file .env run
//! ```

mod daemon;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use tilescale_core::TilescaleConfig;

#[derive(Parser)]
#[command(name = "tilescaled", about = "Autoscaling daemon for the tile-server pool")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text", env = "TILESCALE_LOG_FORMAT")]
    log_format: LogFormat,

    /// Load environment variables (e.g. `TILESCALE_STACK_*` overrides)
    /// from this file before reading the config.
    #[arg(long, global = true, env = "TILESCALE_ENV_FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop and API server.
    Run {
        /// Path to tilescale.toml.
        #[arg(long, default_value = "tilescale.toml", env = "TILESCALE_CONFIG")]
        config: PathBuf,

        /// Port for the API and /metrics endpoint.
        #[arg(long, default_value = "9090", env = "TILESCALE_PORT")]
        port: u16,
    },
    /// Load and validate a config file, then print the effective config.
    Check {
        /// Path to tilescale.toml.
        #[arg(long, default_value = "tilescale.toml", env = "TILESCALE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Some(env_file) = &cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }

    match cli.command {
        Command::Run { config, port } => {
            let config = TilescaleConfig::from_file(&config)?;
            daemon::run(config, port).await
        }
        Command::Check { config } => {
            let config = TilescaleConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tilescaled=debug,tilescale=debug"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
