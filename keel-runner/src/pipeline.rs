//! The standard release pipeline
//!
//! Wires the engine components into the fixed stage order and carries the
//! state stages hand to each other (build id, images, manifest commit).
//!
//! | Stage             | On failure                               |
//! |-------------------|------------------------------------------|
//! | workspace-reset   | abort                                    |
//! | checkout          | abort                                    |
//! | allocate-version  | abort                                    |
//! | credentials       | abort                                    |
//! | static-analysis   | continue                                 |
//! | quality-gate      | abort only when `quality.blocking` is set |
//! | filesystem-scan   | continue                                 |
//! | image-build       | abort                                    |
//! | image-publish     | abort                                    |
//! | manifest-patch    | abort                                    |
//! | cluster-reconcile | abort                                    |

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use keel_core::config::{QualityConfig, ReleaseConfig};
use keel_core::domain::build::BuildId;
use keel_core::domain::cluster::{ReconcileReport, ReconciliationTarget};
use keel_core::domain::image::{ImageReference, LocalImage};
use keel_core::domain::manifest::CommitReference;
use keel_core::domain::report::PipelineReport;
use keel_core::domain::stage::{FailurePolicy, StageOutput};
use keel_core::{ReleaseError, Result};
use tracing::{debug, info, instrument};

use crate::allocator::{BuildCounter, VersionAllocator};
use crate::credentials::{CredentialProvider, Credentials};
use crate::executor::{BoxFuture, Stage, StageExecutor};
use crate::manifest::ManifestPatcher;
use crate::publisher::{ArtifactPublisher, ContainerTool, VulnerabilityScanner};
use crate::quality::{GateStatus, QualityGate};
use crate::reconciler::{ClusterApi, ClusterReconciler};
use crate::scm::SourceControl;

/// Every external system a release talks to
pub struct Collaborators {
    pub counter: Box<dyn BuildCounter>,
    pub scm: Arc<dyn SourceControl>,
    pub containers: Arc<dyn ContainerTool>,
    pub scanner: Arc<dyn VulnerabilityScanner>,
    /// Static analysis; the quality stages are skipped without one
    pub quality: Option<Arc<dyn QualityGate>>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub cluster: Arc<dyn ClusterApi>,
}

/// Shared state of one release run
pub struct ReleaseContext {
    pub config: ReleaseConfig,
    allocator: VersionAllocator,
    scm: Arc<dyn SourceControl>,
    containers: Arc<dyn ContainerTool>,
    scanner: Arc<dyn VulnerabilityScanner>,
    quality: Option<Arc<dyn QualityGate>>,
    credential_provider: Arc<dyn CredentialProvider>,
    cluster: Arc<dyn ClusterApi>,

    pub build_id: Option<BuildId>,
    pub credentials: Option<Credentials>,
    pub local_image: Option<LocalImage>,
    pub image: Option<ImageReference>,
    pub commit: Option<CommitReference>,
    /// The patched manifest, used to create an absent workload
    pub manifest_document: Option<String>,
    pub reconciliation: Option<ReconcileReport>,
}

impl ReleaseContext {
    pub fn new(config: ReleaseConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            allocator: VersionAllocator::new(collaborators.counter),
            scm: collaborators.scm,
            containers: collaborators.containers,
            scanner: collaborators.scanner,
            quality: collaborators.quality,
            credential_provider: collaborators.credentials,
            cluster: collaborators.cluster,
            build_id: None,
            credentials: None,
            local_image: None,
            image: None,
            commit: None,
            manifest_document: None,
            reconciliation: None,
        }
    }

    /// Root of the service source: the checkout, or the current directory
    /// when no source repository is configured
    pub fn source_root(&self) -> PathBuf {
        if self.config.source.repository.is_empty() {
            PathBuf::from(".")
        } else {
            self.config.workspace.source_dir()
        }
    }

    fn publisher(&self) -> ArtifactPublisher {
        ArtifactPublisher::new(
            self.containers.clone(),
            self.scanner.clone(),
            self.config.registry.clone(),
        )
    }

    fn target(&self, image: &ImageReference) -> ReconciliationTarget {
        let service = &self.config.service;
        let cluster = &self.config.cluster;
        ReconciliationTarget {
            namespace: cluster.namespace.clone(),
            workload: cluster.workload_name(service).to_string(),
            container: cluster.container_name(service).to_string(),
            desired_image: image.clone(),
        }
    }
}

/// The stages of a release, in order
pub fn standard_stages(quality: &QualityConfig) -> Vec<Stage<ReleaseContext>> {
    vec![
        Stage::new("workspace-reset", workspace_reset),
        Stage::new("checkout", checkout),
        Stage::new("allocate-version", allocate_version),
        Stage::new("credentials", scope_credentials),
        Stage::new("static-analysis", static_analysis).continue_on_failure(),
        Stage::new("quality-gate", quality_gate)
            .with_policy(FailurePolicy::aborting(quality.blocking)),
        Stage::new("filesystem-scan", filesystem_scan).continue_on_failure(),
        Stage::new("image-build", image_build),
        Stage::new("image-publish", image_publish),
        Stage::new("manifest-patch", manifest_patch),
        Stage::new("cluster-reconcile", cluster_reconcile),
    ]
}

/// Runs the standard pipeline and returns the finished report
#[instrument(skip_all, fields(service = %context.config.service))]
pub async fn run_release(context: &mut ReleaseContext) -> PipelineReport {
    let executor = StageExecutor::new(standard_stages(&context.config.quality));
    let service = context.config.service.clone();
    let mut report = executor.run(&service, context).await;
    report.build_id = context.build_id;
    report
}

// =============================================================================
// Stages
// =============================================================================

/// Refuses to wipe directories that are obviously not a scratch workspace
fn check_workspace_root(root: &Path) -> Result<()> {
    let suspicious = root.as_os_str().is_empty()
        || root
            .components()
            .all(|c| matches!(c, Component::CurDir | Component::ParentDir | Component::RootDir));
    if suspicious {
        return Err(ReleaseError::InvalidConfig(format!(
            "refusing to use '{}' as the workspace root",
            root.display()
        )));
    }
    Ok(())
}

fn workspace_reset(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let root = ctx.config.workspace.root.clone();
        check_workspace_root(&root)?;
        if tokio::fs::try_exists(&root).await? {
            debug!("Clearing workspace {}", root.display());
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;
        Ok(StageOutput::success().with_detail(format!("workspace {}", root.display())))
    })
}

fn checkout(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let source = &ctx.config.source;
        if source.repository.is_empty() {
            return Ok(StageOutput::skipped(
                "no source repository configured, using the current directory",
            ));
        }
        let dest = ctx.config.workspace.source_dir();
        ctx.scm
            .checkout(&source.repository, &source.branch, &dest)
            .await?;
        Ok(StageOutput::success().with_detail(format!("{} ({})", source.repository, source.branch)))
    })
}

fn allocate_version(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let build_id = ctx.allocator.allocate(&ctx.config.service)?;
        ctx.build_id = Some(build_id);
        Ok(StageOutput::success().with_detail(format!("build {}", build_id)))
    })
}

fn scope_credentials(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let credentials = ctx.credential_provider.scope()?;
        let mut scoped = Vec::new();
        if credentials.registry.is_some() {
            scoped.push("registry");
        }
        if credentials.sonar_token.is_some() {
            scoped.push("static-analysis");
        }
        if credentials.cluster_token.is_some() {
            scoped.push("cluster");
        }
        ctx.credentials = Some(credentials);
        let detail = if scoped.is_empty() {
            "no explicit credentials, using ambient logins".to_string()
        } else {
            format!("scoped {}", scoped.join(", "))
        };
        Ok(StageOutput::success().with_detail(detail))
    })
}

fn static_analysis(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let Some(quality) = ctx.quality.clone() else {
            return Ok(StageOutput::skipped("no static-analysis server configured"));
        };
        let summary = quality.analyze(&ctx.source_root()).await?;
        Ok(StageOutput::success().with_detail(summary.detail))
    })
}

fn quality_gate(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let Some(quality) = ctx.quality.clone() else {
            return Ok(StageOutput::skipped("no static-analysis server configured"));
        };
        let timeout = ctx.config.quality.gate_timeout();
        match quality.wait_for_gate(&ctx.source_root(), timeout).await? {
            GateStatus::Passed => Ok(StageOutput::success().with_detail("quality gate passed")),
            GateStatus::Failed { reason } => Err(ReleaseError::QualityGateFailed(reason)),
        }
    })
}

fn filesystem_scan(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let root = ctx.source_root();
        let findings = ctx.scanner.scan_filesystem(&root).await?;
        if findings.is_empty() {
            return Ok(StageOutput::success().with_detail("no findings"));
        }
        Err(ReleaseError::AdvisoryFindingsPresent {
            target: root.display().to_string(),
            summary: findings.summary(),
        })
    })
}

fn image_build(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let build_id = ctx.build_id.ok_or(ReleaseError::MissingStageInput("build id"))?;
        let context_dir = ctx.source_root().join(&ctx.config.source.context_dir);
        let local = ctx
            .publisher()
            .build(&ctx.config.service, build_id, &context_dir)
            .await?;
        let detail = format!("built {} ({})", local.reference, local.id);
        ctx.local_image = Some(local);
        Ok(StageOutput::success().with_detail(detail))
    })
}

fn image_publish(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let local = ctx
            .local_image
            .clone()
            .ok_or(ReleaseError::MissingStageInput("built image"))?;
        let registry_login = ctx.credentials.as_ref().and_then(|c| c.registry.as_ref());
        let publication = ctx.publisher().push(&local, registry_login).await?;

        let mut detail = format!("pushed {}", publication.image);
        if let Some(digest) = &publication.image.digest {
            detail.push_str(&format!(" ({})", digest));
        }
        if !publication.pruned.is_empty() {
            detail.push_str(&format!(", pruned {} old image(s)", publication.pruned.len()));
        }
        ctx.image = Some(publication.image);
        Ok(StageOutput::success()
            .with_detail(detail)
            .with_advisories(publication.advisories))
    })
}

fn manifest_patch(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let manifest = ctx.config.manifest.clone();
        if manifest.repository.is_empty() {
            return Ok(StageOutput::skipped("no manifest repository configured"));
        }
        let image = ctx
            .image
            .clone()
            .ok_or(ReleaseError::MissingStageInput("published image"))?;

        let worktree = ctx.config.workspace.manifest_dir();
        ctx.scm
            .checkout(&manifest.repository, &manifest.branch, &worktree)
            .await?;

        let commit = ManifestPatcher::new(ctx.scm.clone())
            .patch_and_commit(
                &worktree,
                &manifest.path,
                &ctx.config.service,
                &image.tag,
                &manifest.branch,
            )
            .await?;
        ctx.manifest_document = Some(tokio::fs::read_to_string(worktree.join(&manifest.path)).await?);

        let detail = if commit.created {
            format!("committed {} to {}", commit.sha, commit.branch)
        } else {
            format!("manifest already references tag {}", image.tag)
        };
        ctx.commit = Some(commit);
        Ok(StageOutput::success().with_detail(detail))
    })
}

fn cluster_reconcile(ctx: &mut ReleaseContext) -> BoxFuture<'_, Result<StageOutput>> {
    Box::pin(async move {
        let image = ctx
            .image
            .clone()
            .ok_or(ReleaseError::MissingStageInput("published image"))?;
        let target = ctx.target(&image);
        let cluster = &ctx.config.cluster;
        info!(
            "Reconciling {} on cluster {} ({})",
            target,
            if cluster.name.is_empty() { cluster.api_url.as_str() } else { cluster.name.as_str() },
            if cluster.region.is_empty() { "no region" } else { cluster.region.as_str() },
        );

        let report = ClusterReconciler::new(ctx.cluster.clone(), cluster.poll_interval())
            .reconcile(&target, ctx.manifest_document.as_deref(), cluster.rollout_timeout())
            .await?
            .into_result()?;
        let detail = report.path();
        ctx.reconciliation = Some(report);
        Ok(StageOutput::success().with_detail(detail))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemoryBuildCounter;
    use crate::testing::{
        FakeCluster, FakeContainerTool, FakeQualityGate, FakeScanner, FakeSourceControl,
        StaticCredentials,
    };
    use keel_core::domain::stage::StageOutcome;

    fn config(root: &Path) -> ReleaseConfig {
        let mut config = ReleaseConfig::default();
        config.service = "orders".to_string();
        config.registry.uri = "registry.example.com".to_string();
        config.workspace.root = root.join("ws");
        config.cluster.rollout_timeout_secs = 1;
        config.cluster.poll_interval_ms = 5;
        config
    }

    fn context(config: ReleaseConfig, quality: Option<Arc<dyn QualityGate>>) -> ReleaseContext {
        ReleaseContext::new(
            config,
            Collaborators {
                counter: Box::new(MemoryBuildCounter::starting_at(42)),
                scm: Arc::new(FakeSourceControl::new()),
                containers: Arc::new(FakeContainerTool::new()),
                scanner: Arc::new(FakeScanner::clean()),
                quality,
                credentials: Arc::new(StaticCredentials::anonymous()),
                cluster: Arc::new(FakeCluster::new()),
            },
        )
    }

    #[test]
    fn test_workspace_root_guard() {
        assert!(check_workspace_root(Path::new("")).is_err());
        assert!(check_workspace_root(Path::new(".")).is_err());
        assert!(check_workspace_root(Path::new("/")).is_err());
        assert!(check_workspace_root(Path::new("../..")).is_err());
        assert!(check_workspace_root(Path::new(".keel/workspace")).is_ok());
    }

    #[test]
    fn test_stage_order_and_policies() {
        let mut quality = QualityConfig::default();
        let names: Vec<_> = standard_stages(&quality).iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "workspace-reset",
                "checkout",
                "allocate-version",
                "credentials",
                "static-analysis",
                "quality-gate",
                "filesystem-scan",
                "image-build",
                "image-publish",
                "manifest-patch",
                "cluster-reconcile",
            ]
        );
        assert!(!standard_stages(&quality)[5].policy.abort_on_failure);
        quality.blocking = true;
        assert!(standard_stages(&quality)[5].policy.abort_on_failure);
    }

    #[tokio::test]
    async fn test_workspace_reset_clears_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(config(dir.path()), None);
        let stale = ctx.config.workspace.root.join("source/stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        workspace_reset(&mut ctx).await.unwrap();

        assert!(!stale.exists());
        assert!(ctx.config.workspace.root.exists());
    }

    #[tokio::test]
    async fn test_quality_stages_skip_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(config(dir.path()), None);
        assert_eq!(static_analysis(&mut ctx).await.unwrap().outcome, StageOutcome::Skipped);
        assert_eq!(quality_gate(&mut ctx).await.unwrap().outcome, StageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_failed_gate_is_quality_gate_failed() {
        let dir = tempfile::tempdir().unwrap();
        let gate: Arc<dyn QualityGate> = Arc::new(FakeQualityGate::failing("coverage 41%"));
        let mut ctx = context(config(dir.path()), Some(gate));
        let err = quality_gate(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ReleaseError::QualityGateFailed(ref r) if r == "coverage 41%"));
    }

    #[tokio::test]
    async fn test_build_without_version_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(config(dir.path()), None);
        let err = image_build(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ReleaseError::MissingStageInput("build id")));
    }

    #[tokio::test]
    async fn test_reconcile_target_uses_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cluster.namespace = "shop".to_string();
        config.cluster.workload = Some("orders-api".to_string());
        let ctx = context(config, None);
        let image = ImageReference::new("registry.example.com", "orders", BuildId::new(42));

        let target = ctx.target(&image);
        assert_eq!(target.to_string(), "shop/orders-api");
        assert_eq!(target.container, "orders");
    }
}
