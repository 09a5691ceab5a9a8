//! Configuration loading
//!
//! The TOML file provides the release configuration; flags and environment
//! variables given on the command line take precedence over it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use keel_core::ReleaseConfig;

/// Command-line overrides of the configuration file
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Service to release
    #[arg(long, env = "KEEL_SERVICE")]
    pub service: Option<String>,

    /// Registry host and path prefix, without scheme
    #[arg(long, env = "KEEL_REGISTRY")]
    pub registry: Option<String>,

    /// Target namespace
    #[arg(long, env = "KEEL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Cluster API server URL
    #[arg(long, env = "KEEL_CLUSTER_URL")]
    pub cluster_url: Option<String>,

    /// Workspace root (wiped at the start of a release)
    #[arg(long, env = "KEEL_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Rollout timeout in seconds
    #[arg(long)]
    pub rollout_timeout: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ReleaseConfig) {
        if let Some(service) = &self.service {
            config.service = service.clone();
        }
        if let Some(registry) = &self.registry {
            config.registry.uri = registry.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.cluster.namespace = namespace.clone();
        }
        if let Some(url) = &self.cluster_url {
            config.cluster.api_url = url.clone();
        }
        if let Some(workspace) = &self.workspace {
            config.workspace.root = workspace.clone();
        }
        if let Some(timeout) = self.rollout_timeout {
            config.cluster.rollout_timeout_secs = timeout;
        }
    }
}

/// Loads the file, applies overrides and validates the result
pub fn load(path: &Path, overrides: &Overrides) -> Result<ReleaseConfig> {
    let config = load_unvalidated(path, overrides)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Loads the file and applies overrides without validating
///
/// For subcommands that only need part of the configuration.
pub fn load_unvalidated(path: &Path, overrides: &Overrides) -> Result<ReleaseConfig> {
    let mut config = ReleaseConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}
