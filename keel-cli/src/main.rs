//! Keel CLI
//!
//! Command-line entry point of the Keel release orchestrator. `keel release`
//! runs the whole pipeline for one service; the other subcommands run a
//! single engine component on its own.

mod commands;
mod config;
mod render;
mod wiring;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Keel release orchestrator", long_about = None)]
struct Cli {
    /// Release configuration file
    #[arg(short, long, env = "KEEL_CONFIG", default_value = "keel.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_cli=info,keel_runner=info,keel_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = handle_command(cli.command, &cli.config).await?;
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
