//! Artifact publishing
//!
//! Builds the service image, tags it with the build identifier, enforces
//! the retention and republish policies against the registry, pushes, and
//! scans the published image. Published references are never rolled back:
//! if the scan blocks the release after a successful push, the image stays.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::config::{RegistryConfig, RepublishPolicy, RetentionPolicy};
use keel_core::domain::build::BuildId;
use keel_core::domain::image::{ImageReference, LocalImage, RemoteImage};
use keel_core::domain::scan::{Findings, Severity};
use keel_core::{ReleaseError, Result};
use tracing::{info, warn};

use crate::credentials::RegistryCredentials;

/// Container build and registry tooling
#[async_trait]
pub trait ContainerTool: Send + Sync {
    /// Builds `context_dir` and tags the result as `image`
    async fn build(&self, context_dir: &Path, image: &ImageReference) -> Result<LocalImage>;

    async fn login(&self, registry: &str, credentials: &RegistryCredentials) -> Result<()>;

    /// Every image currently in the repository of `image`
    async fn list_remote(&self, image: &ImageReference) -> Result<Vec<RemoteImage>>;

    async fn delete_remote(&self, image: &ImageReference) -> Result<()>;

    /// Pushes and returns the reference with the registry digest filled in
    async fn push(&self, image: &LocalImage) -> Result<ImageReference>;
}

/// Vulnerability scanning of source trees and images
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    async fn scan_filesystem(&self, path: &Path) -> Result<Findings>;

    async fn scan_image(&self, image: &ImageReference) -> Result<Findings>;
}

/// What a successful publish produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub image: ImageReference,
    pub pruned: Vec<ImageReference>,
    /// Image scan result, when the scan ran
    pub findings: Option<Findings>,
    pub advisories: Vec<String>,
}

/// Selects the remote images a retention policy removes
///
/// Only numerically tagged images are candidates (anything else, like
/// `latest`, was put there by someone else), and the tag being published
/// is never a candidate. `KeepLast(n)` keeps the `n` highest build numbers.
pub fn prune_candidates(
    existing: &[RemoteImage],
    policy: RetentionPolicy,
    current_tag: &str,
) -> Vec<ImageReference> {
    let mut numbered: Vec<(u64, &RemoteImage)> = existing
        .iter()
        .filter(|image| image.reference.tag != current_tag)
        .filter_map(|image| image.build_number().map(|n| (n, image)))
        .collect();
    numbered.sort_by(|a, b| b.0.cmp(&a.0));

    let keep = match policy {
        RetentionPolicy::KeepAll => return Vec::new(),
        RetentionPolicy::KeepNone => 0,
        RetentionPolicy::KeepLast(n) => n,
    };

    numbered
        .into_iter()
        .skip(keep)
        .map(|(_, image)| image.reference.clone())
        .collect()
}

pub struct ArtifactPublisher {
    tool: Arc<dyn ContainerTool>,
    scanner: Arc<dyn VulnerabilityScanner>,
    registry: RegistryConfig,
}

impl ArtifactPublisher {
    pub fn new(
        tool: Arc<dyn ContainerTool>,
        scanner: Arc<dyn VulnerabilityScanner>,
        registry: RegistryConfig,
    ) -> Self {
        Self {
            tool,
            scanner,
            registry,
        }
    }

    /// Reference the image of `build_id` is published under
    pub fn image_for(&self, service: &str, build_id: BuildId) -> ImageReference {
        ImageReference::new(&self.registry.uri, service, build_id)
    }

    /// Builds the image for `build_id` from `context_dir`
    pub async fn build(&self, service: &str, build_id: BuildId, context_dir: &Path) -> Result<LocalImage> {
        let image = self.image_for(service, build_id);
        info!("Building {} from {}", image, context_dir.display());
        self.tool
            .build(context_dir, &image)
            .await
            .map_err(|e| ReleaseError::BuildFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })
    }

    /// Pushes a built image, applying retention and scanning the result
    pub async fn push(
        &self,
        local: &LocalImage,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Publication> {
        let image = &local.reference;
        let push_failed = |reason: String| ReleaseError::PushFailed {
            image: image.to_string(),
            reason,
        };
        let mut advisories = Vec::new();

        match credentials {
            Some(credentials) => self
                .tool
                .login(&self.registry.uri, credentials)
                .await
                .map_err(|e| push_failed(format!("registry login: {}", e)))?,
            None => info!("No registry credentials scoped, relying on existing login"),
        }

        let existing = match self.tool.list_remote(image).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Could not list {}: {}", image.repository(), e);
                advisories.push(format!(
                    "could not list {}, retention and republish checks skipped: {}",
                    image.repository(),
                    e
                ));
                Vec::new()
            }
        };

        if existing.iter().any(|remote| remote.reference.tag == image.tag) {
            match self.registry.republish {
                RepublishPolicy::Reject => {
                    return Err(push_failed(format!(
                        "tag {} already exists in {}",
                        image.tag,
                        image.repository()
                    )));
                }
                RepublishPolicy::Overwrite => {
                    warn!("Overwriting existing tag {}", image);
                    advisories.push(format!("overwrote existing tag {}", image));
                }
            }
        }

        let mut pruned = Vec::new();
        for candidate in prune_candidates(&existing, self.registry.retention, &image.tag) {
            match self.tool.delete_remote(&candidate).await {
                Ok(()) => {
                    info!("Pruned {}", candidate);
                    pruned.push(candidate);
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", candidate, e);
                    advisories.push(format!("failed to prune {}: {}", candidate, e));
                }
            }
        }

        let published = self
            .tool
            .push(local)
            .await
            .map_err(|e| push_failed(e.to_string()))?;
        info!(
            "Pushed {} ({})",
            published,
            published.digest.as_deref().unwrap_or("no digest")
        );

        let findings = match self.scanner.scan_image(&published).await {
            Ok(findings) => {
                self.check_threshold(&published.to_string(), &findings)?;
                if !findings.is_empty() {
                    advisories.push(format!("image scan: {}", findings.summary()));
                }
                Some(findings)
            }
            Err(e) if self.registry.scan_threshold.is_some() => return Err(e),
            Err(e) => {
                warn!("Image scan of {} failed: {}", published, e);
                advisories.push(format!("image scan failed: {}", e));
                None
            }
        };

        Ok(Publication {
            image: published,
            pruned,
            findings,
            advisories,
        })
    }

    /// Builds and pushes in one go
    pub async fn publish(
        &self,
        service: &str,
        build_id: BuildId,
        context_dir: &Path,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Publication> {
        let local = self.build(service, build_id, context_dir).await?;
        self.push(&local, credentials).await
    }

    /// Fails with `ScanThresholdExceeded` when findings cross the blocking threshold
    pub fn check_threshold(&self, target: &str, findings: &Findings) -> Result<()> {
        let Some(threshold) = self.registry.scan_threshold else {
            return Ok(());
        };
        blocking_findings(target, findings, threshold)
    }
}

fn blocking_findings(target: &str, findings: &Findings, threshold: Severity) -> Result<()> {
    let count = findings.at_or_above(threshold);
    if count > 0 {
        return Err(ReleaseError::ScanThresholdExceeded {
            target: target.to_string(),
            threshold,
            count,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeContainerTool, FakeScanner};

    fn registry(retention: RetentionPolicy, republish: RepublishPolicy) -> RegistryConfig {
        RegistryConfig {
            uri: "registry.example.com/team".to_string(),
            retention,
            republish,
            scan_threshold: None,
        }
    }

    fn remote(tags: &[&str]) -> Vec<RemoteImage> {
        let base = ImageReference::new("registry.example.com/team", "orders", BuildId::new(1));
        tags.iter()
            .map(|t| RemoteImage {
                reference: base.with_tag(*t),
            })
            .collect()
    }

    fn tags(images: &[ImageReference]) -> Vec<&str> {
        images.iter().map(|i| i.tag.as_str()).collect()
    }

    #[test]
    fn test_prune_keep_last() {
        let existing = remote(&["38", "40", "latest", "39", "41"]);
        let pruned = prune_candidates(&existing, RetentionPolicy::KeepLast(2), "42");
        assert_eq!(tags(&pruned), vec!["39", "38"]);
    }

    #[test]
    fn test_prune_keep_none_spares_current_and_named_tags() {
        let existing = remote(&["41", "42", "latest"]);
        let pruned = prune_candidates(&existing, RetentionPolicy::KeepNone, "42");
        assert_eq!(tags(&pruned), vec!["41"]);
    }

    #[test]
    fn test_prune_keep_all() {
        let existing = remote(&["1", "2", "3"]);
        assert!(prune_candidates(&existing, RetentionPolicy::KeepAll, "4").is_empty());
    }

    #[tokio::test]
    async fn test_publish_tags_with_build_id() {
        let tool = Arc::new(FakeContainerTool::new());
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject),
        );

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();

        assert_eq!(publication.image.to_string(), "registry.example.com/team/orders:42");
        assert!(publication.image.digest.is_some());
        assert!(publication.advisories.is_empty());
        assert_eq!(tool.pushed_tags(), vec!["42"]);
    }

    #[tokio::test]
    async fn test_existing_tag_is_rejected_by_default() {
        let tool = Arc::new(FakeContainerTool::new().with_remote_tags(&["41", "42"]));
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject),
        );

        let err = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::PushFailed { .. }));
        assert!(tool.pushed_tags().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_policy_pushes_with_advisory() {
        let tool = Arc::new(FakeContainerTool::new().with_remote_tags(&["42"]));
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Overwrite),
        );

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();
        assert_eq!(tool.pushed_tags(), vec!["42"]);
        assert!(publication.advisories[0].contains("overwrote"));
    }

    #[tokio::test]
    async fn test_prune_failure_is_advisory() {
        let tool = Arc::new(
            FakeContainerTool::new()
                .with_remote_tags(&["40", "41"])
                .failing_deletes(),
        );
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepNone, RepublishPolicy::Reject),
        );

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();
        assert!(publication.pruned.is_empty());
        assert_eq!(publication.advisories.len(), 2);
        assert_eq!(tool.pushed_tags(), vec!["42"]);
    }

    #[tokio::test]
    async fn test_retention_prunes_before_push() {
        let tool = Arc::new(FakeContainerTool::new().with_remote_tags(&["39", "40", "41"]));
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepLast(1), RepublishPolicy::Reject),
        );

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();
        assert_eq!(tags(&publication.pruned), vec!["40", "39"]);
        assert_eq!(tool.remote_tags(), vec!["41", "42"]);
    }

    #[tokio::test]
    async fn test_build_failure_maps_to_build_failed() {
        let tool = Arc::new(FakeContainerTool::new().failing_build());
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject),
        );

        let err = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::BuildFailed { .. }));
        assert!(tool.pushed_tags().is_empty());
    }

    #[tokio::test]
    async fn test_scan_threshold_blocks_but_keeps_pushed_image() {
        let tool = Arc::new(FakeContainerTool::new());
        let scanner = FakeScanner::clean().with_image_findings(
            Findings::new()
                .with(Severity::Critical, 1)
                .with(Severity::Low, 4),
        );
        let mut config = registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject);
        config.scan_threshold = Some(Severity::High);
        let publisher = ArtifactPublisher::new(tool.clone(), Arc::new(scanner), config);

        let err = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ScanThresholdExceeded { count: 1, .. }));
        assert_eq!(tool.pushed_tags(), vec!["42"]);
    }

    #[tokio::test]
    async fn test_findings_below_threshold_are_advisory() {
        let scanner =
            FakeScanner::clean().with_image_findings(Findings::new().with(Severity::Medium, 2));
        let mut config = registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject);
        config.scan_threshold = Some(Severity::High);
        let publisher =
            ArtifactPublisher::new(Arc::new(FakeContainerTool::new()), Arc::new(scanner), config);

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();
        assert_eq!(publication.advisories, vec!["image scan: 2 medium".to_string()]);
    }

    #[tokio::test]
    async fn test_scanner_error_is_advisory_without_threshold() {
        let publisher = ArtifactPublisher::new(
            Arc::new(FakeContainerTool::new()),
            Arc::new(FakeScanner::failing()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject),
        );

        let publication = publisher
            .publish("orders", BuildId::new(42), Path::new("."), None)
            .await
            .unwrap();
        assert!(publication.findings.is_none());
        assert!(publication.advisories[0].starts_with("image scan failed"));
    }

    #[tokio::test]
    async fn test_login_used_when_credentials_scoped() {
        let tool = Arc::new(FakeContainerTool::new());
        let publisher = ArtifactPublisher::new(
            tool.clone(),
            Arc::new(FakeScanner::clean()),
            registry(RetentionPolicy::KeepAll, RepublishPolicy::Reject),
        );
        let credentials = RegistryCredentials {
            username: "ci".to_string(),
            password: "secret".to_string(),
        };

        publisher
            .publish("orders", BuildId::new(42), Path::new("."), Some(&credentials))
            .await
            .unwrap();
        assert_eq!(tool.logins(), vec!["registry.example.com/team".to_string()]);
    }
}
