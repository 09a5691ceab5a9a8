//! `keel patch`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::*;
use keel_runner::ManifestPatcher;
use keel_runner::manifest::{Patch, patch_document};

use crate::config::{self, Overrides};
use crate::wiring;

#[derive(Args)]
pub struct PatchArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// New image tag
    #[arg(long)]
    pub tag: String,

    /// Checkout of the manifest repository
    #[arg(long, default_value = ".")]
    pub worktree: PathBuf,

    /// Manifest path inside the worktree (default: manifest.path)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Branch to push to (default: manifest.branch)
    #[arg(long)]
    pub branch: Option<String>,

    /// Only rewrite the file, do not commit or push
    #[arg(long)]
    pub no_commit: bool,
}

pub async fn handle_patch(args: PatchArgs, config_path: &Path) -> Result<i32> {
    let config = config::load_unvalidated(config_path, &args.overrides)?;
    if config.service.trim().is_empty() {
        bail!("No service given (set `service` in {} or pass --service)", config_path.display());
    }
    let manifest = args.manifest.unwrap_or_else(|| config.manifest.path.clone());

    if args.no_commit {
        let file = args.worktree.join(&manifest);
        let document = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        match patch_document(&document, &config.service, &args.tag, &manifest.display().to_string())? {
            Patch::Unchanged => {
                println!("{} already references {}:{}", file.display(), config.service, args.tag);
            }
            Patch::Rewritten {
                document,
                previous_tag,
                line,
            } => {
                std::fs::write(&file, document)
                    .with_context(|| format!("Failed to write {}", file.display()))?;
                println!(
                    "{} {}:{}: {} -> {}",
                    "✓".green(),
                    file.display(),
                    line,
                    previous_tag.dimmed(),
                    args.tag.cyan()
                );
            }
        }
        return Ok(0);
    }

    let branch = args.branch.unwrap_or_else(|| config.manifest.branch.clone());
    let patcher = ManifestPatcher::new(Arc::new(wiring::source_control(&config.manifest)));
    let commit = patcher
        .patch_and_commit(&args.worktree, &manifest, &config.service, &args.tag, &branch)
        .await?;

    if commit.created {
        println!(
            "{} Committed {} to {}",
            "✓".green(),
            commit.sha.cyan(),
            commit.branch
        );
        println!("  {}", commit.message.dimmed());
    } else {
        println!(
            "Manifest already references {}:{}, nothing committed ({})",
            config.service,
            args.tag,
            commit.sha.dimmed()
        );
    }
    Ok(0)
}
