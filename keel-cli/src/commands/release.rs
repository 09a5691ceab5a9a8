//! `keel release`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use keel_core::domain::report::PipelineReport;
use keel_runner::{ReleaseContext, run_release};
use tracing::info;

use crate::config::{self, Overrides};
use crate::render::print_report;
use crate::wiring;

/// File name of the report inside the workspace
pub const REPORT_FILE: &str = "release-report.json";

#[derive(Args)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Where to write the JSON report (default: <workspace>/release-report.json)
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Skip TLS verification when talking to the registry
    #[arg(long, env = "KEEL_INSECURE_REGISTRY")]
    pub insecure_registry: bool,

    /// Do not check for required tools before starting
    #[arg(long)]
    pub skip_preflight: bool,
}

pub async fn handle_release(args: ReleaseArgs, config_path: &Path) -> Result<i32> {
    let config = config::load(config_path, &args.overrides)?;
    if !args.skip_preflight {
        wiring::preflight(&config).await?;
    }

    let collaborators = wiring::collaborators(&config, args.insecure_registry)?;
    let report_path = args
        .report
        .unwrap_or_else(|| config.workspace.root.join(REPORT_FILE));

    info!("Releasing {} to {}", config.service, config.cluster.namespace);
    let mut context = ReleaseContext::new(config, collaborators);
    let report = run_release(&mut context).await;

    print_report(&report);
    write_report(&report, &report_path)?;
    println!("\nReport written to {}", report_path.display().to_string().cyan());

    Ok(report.exit_code())
}

fn write_report(report: &PipelineReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = report.to_json_pretty().context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_written_where_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        let mut report = PipelineReport::new("orders");
        report.finish();

        write_report(&report, &path).unwrap();

        let saved = PipelineReport::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, report);
    }
}
