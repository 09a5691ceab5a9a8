//! `keel reconcile`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Args;
use colored::*;
use keel_core::domain::cluster::{ReconcileReport, ReconciliationOutcome, ReconciliationTarget};
use keel_core::domain::image::ImageReference;
use keel_runner::ClusterReconciler;

use crate::config::{self, Overrides};
use crate::wiring;

#[derive(Args)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Desired image, e.g. registry.example.com/team/orders:42
    #[arg(long)]
    pub image: String,

    /// Deployment document used when the workload does not exist yet
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

pub async fn handle_reconcile(args: ReconcileArgs, config_path: &Path) -> Result<i32> {
    let mut config = config::load_unvalidated(config_path, &args.overrides)?;
    let image = ImageReference::parse(&args.image)
        .ok_or_else(|| anyhow!("'{}' is not a registry/service:tag reference", args.image))?;
    if config.service.trim().is_empty() {
        config.service = image.service.clone();
    }
    if config.registry.uri.trim().is_empty() {
        config.registry.uri = image.registry.clone();
    }
    config.validate().context("Invalid configuration")?;

    let document = match &args.manifest {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let cluster = &config.cluster;
    let target = ReconciliationTarget {
        namespace: cluster.namespace.clone(),
        workload: cluster.workload_name(&config.service).to_string(),
        container: cluster.container_name(&config.service).to_string(),
        desired_image: image,
    };

    let client = wiring::cluster_client(cluster)?;
    let report = ClusterReconciler::new(Arc::new(client), cluster.poll_interval())
        .reconcile(&target, document.as_deref(), cluster.rollout_timeout())
        .await?;

    print_reconcile(&report);
    Ok(if report.outcome == ReconciliationOutcome::RolloutFailed { 1 } else { 0 })
}

fn print_reconcile(report: &ReconcileReport) {
    let outcome = format!("{:?}", report.outcome);
    let outcome = match report.outcome {
        ReconciliationOutcome::RolloutFailed => outcome.red(),
        _ => outcome.green(),
    };
    println!("{} {}", report.target.to_string().bold(), outcome);
    println!("  Image: {}", report.target.desired_image.to_string().cyan());
    println!("  Path:  {}", report.path());
    if let Some(detail) = &report.detail {
        println!("  {}", detail.dimmed());
    }
}
