//! Podman and skopeo as the container tool
//!
//! Images are built and pushed with podman. Listing and deleting tags in
//! the registry goes through skopeo, which talks to the registry directly
//! and needs no local image store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_core::domain::image::{ImageReference, LocalImage, RemoteImage};
use keel_core::{ReleaseError, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::{run, run_checked};
use crate::credentials::RegistryCredentials;
use crate::publisher::ContainerTool;

const PODMAN: &str = "podman";
const SKOPEO: &str = "skopeo";

/// Registry errors skopeo reports for a repository that has no images yet
const UNKNOWN_REPOSITORY_MARKERS: &[&str] = &["name unknown", "repository name not known", "not found"];

pub struct PodmanTool {
    /// Verify registry TLS certificates
    tls_verify: bool,
    scratch_dir: PathBuf,
}

impl PodmanTool {
    pub fn new() -> Self {
        Self {
            tls_verify: true,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Talk to registries without TLS verification (local test registries)
    pub fn insecure(mut self) -> Self {
        self.tls_verify = false;
        self
    }

    fn tls_flag(&self) -> String {
        format!("--tls-verify={}", self.tls_verify)
    }

    /// A fresh path for podman to write an ID or digest into
    fn scratch_file(&self, suffix: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("keel-{}.{}", Uuid::new_v4(), suffix))
    }

    async fn read_scratch(&self, path: &Path, tool: &str) -> Result<String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ReleaseError::tool(tool, format!("no output written to {}: {}", path.display(), e)))?;
        let _ = tokio::fs::remove_file(path).await;
        Ok(contents.trim().to_string())
    }
}

impl Default for PodmanTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// Parses `skopeo list-tags` output
pub fn parse_tag_list(json: &str) -> Result<Vec<String>> {
    let list: TagList = serde_json::from_str(json)
        .map_err(|e| ReleaseError::tool(SKOPEO, format!("unexpected list-tags output: {}", e)))?;
    Ok(list.tags)
}

/// Host part of a registry URI ("registry.example.com/team" -> "registry.example.com")
fn registry_host(registry: &str) -> &str {
    registry.split('/').next().unwrap_or(registry)
}

#[async_trait]
impl ContainerTool for PodmanTool {
    async fn build(&self, context_dir: &Path, image: &ImageReference) -> Result<LocalImage> {
        let iidfile = self.scratch_file("iid");
        run_checked(
            PODMAN,
            Command::new(PODMAN)
                .arg("build")
                .arg("--tag")
                .arg(image.to_string())
                .arg("--iidfile")
                .arg(&iidfile)
                .arg(context_dir),
        )
        .await?;

        let id = self.read_scratch(&iidfile, PODMAN).await?;
        info!("Built {} ({})", image, id);
        Ok(LocalImage {
            id,
            reference: image.clone(),
        })
    }

    async fn login(&self, registry: &str, credentials: &RegistryCredentials) -> Result<()> {
        let host = registry_host(registry);
        let output = run(
            PODMAN,
            Command::new(PODMAN)
                .arg("login")
                .arg(self.tls_flag())
                .arg("--username")
                .arg(&credentials.username)
                .arg("--password-stdin")
                .arg(host),
            Some(&credentials.password),
        )
        .await?;

        if !output.success {
            return Err(ReleaseError::tool(PODMAN, output.failure_summary()));
        }
        debug!("Logged in to {} as {}", host, credentials.username);
        Ok(())
    }

    async fn list_remote(&self, image: &ImageReference) -> Result<Vec<RemoteImage>> {
        let output = run(
            SKOPEO,
            Command::new(SKOPEO)
                .arg("list-tags")
                .arg(self.tls_flag())
                .arg(format!("docker://{}", image.repository())),
            None,
        )
        .await?;

        if !output.success {
            let stderr = output.stderr.to_lowercase();
            if UNKNOWN_REPOSITORY_MARKERS.iter().any(|m| stderr.contains(m)) {
                debug!("{} has no images yet", image.repository());
                return Ok(Vec::new());
            }
            return Err(ReleaseError::tool(SKOPEO, output.failure_summary()));
        }

        Ok(parse_tag_list(&output.stdout)?
            .into_iter()
            .map(|tag| RemoteImage {
                reference: image.with_tag(tag),
            })
            .collect())
    }

    async fn delete_remote(&self, image: &ImageReference) -> Result<()> {
        run_checked(
            SKOPEO,
            Command::new(SKOPEO)
                .arg("delete")
                .arg(self.tls_flag())
                .arg(format!("docker://{}", image)),
        )
        .await?;
        Ok(())
    }

    async fn push(&self, image: &LocalImage) -> Result<ImageReference> {
        let digestfile = self.scratch_file("digest");
        run_checked(
            PODMAN,
            Command::new(PODMAN)
                .arg("push")
                .arg(self.tls_flag())
                .arg("--digestfile")
                .arg(&digestfile)
                .arg(image.reference.to_string()),
        )
        .await?;

        let digest = self.read_scratch(&digestfile, PODMAN).await?;
        Ok(image.reference.clone().with_digest(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_list() {
        let json = r#"{"Repository":"registry.example.com/team/orders","Tags":["40","41","latest"]}"#;
        assert_eq!(parse_tag_list(json).unwrap(), vec!["40", "41", "latest"]);
    }

    #[test]
    fn test_parse_empty_tag_list() {
        assert!(parse_tag_list(r#"{"Repository":"r/orders"}"#).unwrap().is_empty());
        assert!(parse_tag_list("not json").is_err());
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("registry.example.com/team"), "registry.example.com");
        assert_eq!(registry_host("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_scratch_files_are_unique() {
        let tool = PodmanTool::new().insecure();
        assert_ne!(tool.scratch_file("iid"), tool.scratch_file("iid"));
        assert_eq!(tool.tls_flag(), "--tls-verify=false");
    }
}
