//! Commands module
//!
//! Defines all CLI commands and their handlers. Every handler returns the
//! process exit code.

mod allocate;
mod patch;
mod reconcile;
mod release;
mod report;

pub use patch::PatchArgs;
pub use reconcile::ReconcileArgs;
pub use release::ReleaseArgs;

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Overrides;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the full release pipeline for one service
    Release(ReleaseArgs),
    /// Allocate and print the next build identifier
    Allocate {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Rewrite the service's image tag in a manifest
    Patch(PatchArgs),
    /// Converge the cluster workload onto an image
    Reconcile(ReconcileArgs),
    /// Print a saved release report
    Report {
        /// Path of the JSON report
        path: std::path::PathBuf,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config_path: &Path) -> Result<i32> {
    match command {
        Commands::Release(args) => release::handle_release(args, config_path).await,
        Commands::Allocate { overrides } => allocate::handle_allocate(&overrides, config_path),
        Commands::Patch(args) => patch::handle_patch(args, config_path).await,
        Commands::Reconcile(args) => reconcile::handle_reconcile(args, config_path).await,
        Commands::Report { path } => report::handle_report(&path),
    }
}
