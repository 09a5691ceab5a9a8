//! Construction of the process-backed collaborators

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_client::KubeClient;
use keel_core::ReleaseConfig;
use keel_core::config::{ClusterConfig, ManifestConfig};
use keel_runner::Collaborators;
use keel_runner::allocator::counter_from_config;
use keel_runner::credentials::{CLUSTER_TOKEN, EnvCredentials, SONAR_TOKEN};
use keel_runner::quality::QualityGate;
use keel_runner::tools::check_available;
use keel_runner::tools::git::{CommitIdentity, GitCli};
use keel_runner::tools::podman::PodmanTool;
use keel_runner::tools::sonar::SonarQualityGate;
use keel_runner::tools::trivy::TrivyScanner;
use tracing::debug;

/// Everything a release talks to, backed by real tools and the cluster API
pub fn collaborators(config: &ReleaseConfig, insecure_registry: bool) -> Result<Collaborators> {
    let quality = config.quality.sonar_host.as_ref().map(|host| {
        let project_key = config
            .quality
            .project_key
            .clone()
            .unwrap_or_else(|| config.service.clone());
        Arc::new(SonarQualityGate::new(
            host.as_str(),
            project_key,
            std::env::var(SONAR_TOKEN).ok(),
        )) as Arc<dyn QualityGate>
    });

    let containers = if insecure_registry {
        PodmanTool::new().insecure()
    } else {
        PodmanTool::new()
    };

    Ok(Collaborators {
        counter: counter_from_config(&config.counter),
        scm: Arc::new(source_control(&config.manifest)),
        containers: Arc::new(containers),
        scanner: Arc::new(TrivyScanner::new()),
        quality,
        credentials: Arc::new(EnvCredentials::new()),
        cluster: Arc::new(cluster_client(&config.cluster)?),
    })
}

pub fn source_control(manifest: &ManifestConfig) -> GitCli {
    GitCli::new(CommitIdentity {
        name: manifest.author_name.clone(),
        email: manifest.author_email.clone(),
    })
}

/// Cluster client with the configured CA bundle and bearer token
///
/// The token comes from `cluster.token_file`, or from `KEEL_CLUSTER_TOKEN`
/// when no file is configured.
pub fn cluster_client(cluster: &ClusterConfig) -> Result<KubeClient> {
    let client = match &cluster.ca_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read cluster CA bundle {}", path.display()))?;
            KubeClient::with_ca_bundle(&cluster.api_url, &pem)?
        }
        None => KubeClient::new(&cluster.api_url),
    };

    let token = match &cluster.token_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read cluster token {}", path.display()))?,
        ),
        None => std::env::var(CLUSTER_TOKEN).ok(),
    };
    debug!(
        "Cluster client for {} ({})",
        client.base_url(),
        if token.is_some() { "token" } else { "anonymous" }
    );

    Ok(match token {
        Some(token) => client.with_token(token),
        None => client,
    })
}

/// Fails early when a tool the release shells out to is missing
pub async fn preflight(config: &ReleaseConfig) -> Result<()> {
    let mut tools = vec!["podman", "skopeo", "trivy"];
    if !config.source.repository.is_empty() || !config.manifest.repository.is_empty() {
        tools.push("git");
    }
    if config.quality.sonar_host.is_some() {
        tools.push("sonar-scanner");
    }
    for tool in tools {
        check_available(tool)
            .await
            .with_context(|| format!("{} is required for a release", tool))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_token_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("token");
        std::fs::write(&token, "secret\n").unwrap();
        let cluster = ClusterConfig {
            api_url: "https://k.example.com/".to_string(),
            token_file: Some(token),
            ..Default::default()
        };
        let client = cluster_client(&cluster).unwrap();
        assert_eq!(client.base_url(), "https://k.example.com");
    }

    #[test]
    fn test_missing_ca_bundle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = ClusterConfig {
            ca_file: Some(dir.path().join("ca.pem")),
            ..Default::default()
        };
        let err = cluster_client(&cluster).unwrap_err();
        assert!(err.to_string().contains("CA bundle"));
    }
}
