//! Cluster reconciliation
//!
//! Converges a workload on the desired image. The cluster is asked for the
//! current state on every run; nothing is cached between invocations, so
//! running twice with the same target is safe and ends in `Stable`.
//!
//! ```text
//! Absent  -> Created  -> Stable | RolloutFailed
//! Absent  -> Created  -> Updating -> ...  (manifest pinned another image)
//! Present -> Updating -> Stable | RolloutFailed
//! Present -> Stable                (already on the desired image)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::cluster::{
    NamespaceStatus, ReconcileReport, ReconcileState, ReconciliationOutcome, ReconciliationTarget,
    RolloutStatus, Workload,
};
use keel_core::{ReleaseError, Result};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// The slice of the cluster control plane reconciliation needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>>;

    /// Creates or replaces the workload from a full manifest document
    async fn apply_manifest(&self, namespace: &str, name: &str, document: &str) -> Result<()>;

    /// Changes only the image of one container, leaving every other field alone
    async fn set_image(&self, namespace: &str, name: &str, container: &str, image: &str) -> Result<()>;

    async fn rollout_status(&self, namespace: &str, name: &str) -> Result<RolloutStatus>;

    async fn create_namespace(&self, namespace: &str) -> Result<NamespaceStatus>;
}

pub struct ClusterReconciler {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

/// How a rollout wait ended
enum Settled {
    Stable(String),
    Failed(String),
}

impl ClusterReconciler {
    pub fn new(api: Arc<dyn ClusterApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    /// Converges `target`, waiting at most `timeout` for the rollout
    ///
    /// `manifest` is the full deployment document, used only when the
    /// workload does not exist yet. An existing workload only has the image
    /// of the target container changed, so fields owned by other
    /// controllers (replica counts set by an autoscaler, for example) are
    /// left alone.
    ///
    /// API failures while creating or updating fail with
    /// `ClusterApplyFailed`. A rollout that does not stabilize is reported
    /// through the returned report's `RolloutFailed` outcome rather than as
    /// an error, see [`ReconcileReport::into_result`].
    #[instrument(skip_all, fields(target = %target))]
    pub async fn reconcile(
        &self,
        target: &ReconciliationTarget,
        manifest: Option<&str>,
        timeout: Duration,
    ) -> Result<ReconcileReport> {
        let desired = target.desired_image.to_string();
        let apply_failed = |reason: String| ReleaseError::ClusterApplyFailed {
            namespace: target.namespace.clone(),
            workload: target.workload.clone(),
            reason,
        };

        match self
            .api
            .create_namespace(&target.namespace)
            .await
            .map_err(|e| apply_failed(format!("namespace: {}", e)))?
        {
            NamespaceStatus::Created => info!("Created namespace {}", target.namespace),
            NamespaceStatus::AlreadyExists => debug!("Namespace {} exists", target.namespace),
        }

        let current = self
            .api
            .get_workload(&target.namespace, &target.workload)
            .await
            .map_err(|e| apply_failed(e.to_string()))?;

        let mut transitions = Vec::new();
        let outcome = match current {
            None => {
                transitions.push(ReconcileState::Absent);
                let document = manifest.ok_or_else(|| {
                    apply_failed("workload is absent and no manifest document was provided".to_string())
                })?;
                info!("{} is absent, creating it with {}", target, desired);
                self.api
                    .apply_manifest(&target.namespace, &target.workload, document)
                    .await
                    .map_err(|e| apply_failed(e.to_string()))?;
                transitions.push(ReconcileState::Created);

                // The document may pin an older image than the target
                let created = self
                    .api
                    .get_workload(&target.namespace, &target.workload)
                    .await
                    .map_err(|e| apply_failed(e.to_string()))?
                    .ok_or_else(|| apply_failed("workload missing after apply".to_string()))?;
                match created.image_of(&target.container) {
                    None => {
                        return Err(apply_failed(format!(
                            "container '{}' not found in applied manifest",
                            target.container
                        )));
                    }
                    Some(image) if image == desired => {}
                    Some(image) => {
                        warn!("Manifest for {} references {}, setting {}", target, image, desired);
                        self.api
                            .set_image(&target.namespace, &target.workload, &target.container, &desired)
                            .await
                            .map_err(|e| apply_failed(e.to_string()))?;
                        transitions.push(ReconcileState::Updating);
                    }
                }
                ReconciliationOutcome::Created
            }
            Some(workload) => {
                transitions.push(ReconcileState::Present);
                match workload.image_of(&target.container) {
                    None => {
                        return Err(apply_failed(format!(
                            "container '{}' not found in workload",
                            target.container
                        )));
                    }
                    Some(image) if image == desired => {
                        info!("{} already runs {}", target, desired);
                        ReconciliationOutcome::Stable
                    }
                    Some(image) => {
                        info!("Updating {} from {} to {}", target, image, desired);
                        self.api
                            .set_image(&target.namespace, &target.workload, &target.container, &desired)
                            .await
                            .map_err(|e| apply_failed(e.to_string()))?;
                        transitions.push(ReconcileState::Updating);
                        ReconciliationOutcome::Updated
                    }
                }
            }
        };

        let (outcome, detail) = match self.wait_for_rollout(target, timeout).await {
            Settled::Stable(detail) => {
                transitions.push(ReconcileState::Stable);
                (outcome, detail)
            }
            Settled::Failed(reason) => {
                warn!("Rollout of {} failed: {}", target, reason);
                transitions.push(ReconcileState::RolloutFailed);
                (ReconciliationOutcome::RolloutFailed, reason)
            }
        };

        let report = ReconcileReport {
            target: target.clone(),
            transitions,
            outcome,
            detail: Some(detail),
        };
        info!("Reconciled {}: {}", target, report.path());
        Ok(report)
    }

    /// Polls rollout status until it settles or the deadline passes
    ///
    /// Status read errors are retried until the deadline; a single slow API
    /// call can not stretch the wait past it either.
    async fn wait_for_rollout(&self, target: &ReconciliationTarget, timeout: Duration) -> Settled {
        let deadline = Instant::now() + timeout;
        let mut last_seen = String::from("no status observed");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let status = tokio::time::timeout(
                remaining,
                self.api.rollout_status(&target.namespace, &target.workload),
            )
            .await;

            match status {
                Ok(Ok(RolloutStatus::Complete)) => return Settled::Stable("rollout complete".to_string()),
                Ok(Ok(RolloutStatus::Failed { reason })) => return Settled::Failed(reason),
                Ok(Ok(progress)) => {
                    debug!("{}: {}", target, progress);
                    last_seen = progress.to_string();
                }
                Ok(Err(e)) => {
                    warn!("Reading rollout status of {} failed: {}", target, e);
                    last_seen = e.to_string();
                }
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Settled::Failed(format!(
                    "timed out after {:?} (last status: {})",
                    timeout, last_seen
                ));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use keel_core::domain::build::BuildId;
    use keel_core::domain::image::ImageReference;

    const MANIFEST: &str = "kind: Deployment\nspec:\n  replicas: 2\n  template:\n    spec:\n      containers:\n        - name: orders\n          image: registry.example.com/orders:42\n";

    fn target(build: u64) -> ReconciliationTarget {
        ReconciliationTarget {
            namespace: "shop".to_string(),
            workload: "orders".to_string(),
            container: "orders".to_string(),
            desired_image: ImageReference::new("registry.example.com", "orders", BuildId::new(build)),
        }
    }

    fn reconciler(cluster: &Arc<FakeCluster>) -> ClusterReconciler {
        ClusterReconciler::new(cluster.clone(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_absent_workload_is_created() {
        let cluster = Arc::new(FakeCluster::new());
        let report = reconciler(&cluster)
            .reconcile(&target(42), Some(MANIFEST), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            report.transitions,
            vec![ReconcileState::Absent, ReconcileState::Created, ReconcileState::Stable]
        );
        assert_eq!(report.outcome, ReconciliationOutcome::Created);
        let workload = cluster.workload("shop", "orders").unwrap();
        assert_eq!(workload.image_of("orders"), Some("registry.example.com/orders:42"));
        assert_eq!(workload.replicas, Some(2));
        assert!(cluster.has_namespace("shop"));
    }

    #[tokio::test]
    async fn test_created_from_stale_manifest_ends_on_desired_image() {
        let cluster = Arc::new(FakeCluster::new());
        let stale = MANIFEST.replace("orders:42", "orders:41");
        let report = reconciler(&cluster)
            .reconcile(&target(42), Some(&stale), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            report.transitions,
            vec![
                ReconcileState::Absent,
                ReconcileState::Created,
                ReconcileState::Updating,
                ReconcileState::Stable
            ]
        );
        assert_eq!(report.outcome, ReconciliationOutcome::Created);
        let workload = cluster.workload("shop", "orders").unwrap();
        assert_eq!(workload.image_of("orders"), Some("registry.example.com/orders:42"));
        assert_eq!(workload.replicas, Some(2));
        assert_eq!(cluster.mutations(), 2);
    }

    #[tokio::test]
    async fn test_manifest_without_target_container_fails() {
        let cluster = Arc::new(FakeCluster::new());
        let mut target = target(42);
        target.container = "worker".to_string();
        let err = reconciler(&cluster)
            .reconcile(&target, Some(MANIFEST), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ClusterApplyFailed { .. }));
        assert!(err.to_string().contains("worker"));
    }

    #[tokio::test]
    async fn test_absent_without_manifest_fails() {
        let cluster = Arc::new(FakeCluster::new());
        let err = reconciler(&cluster)
            .reconcile(&target(42), None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ClusterApplyFailed { .. }));
    }

    #[tokio::test]
    async fn test_update_keeps_replica_count() {
        let cluster = Arc::new(
            FakeCluster::new().with_workload("shop", "orders", "registry.example.com/orders:41", 5),
        );
        let report = reconciler(&cluster)
            .reconcile(&target(42), Some(MANIFEST), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.path(), "Present -> Updating -> Stable");
        assert_eq!(report.outcome, ReconciliationOutcome::Updated);
        let workload = cluster.workload("shop", "orders").unwrap();
        assert_eq!(workload.image_of("orders"), Some("registry.example.com/orders:42"));
        assert_eq!(workload.replicas, Some(5));
    }

    #[tokio::test]
    async fn test_second_run_is_stable_noop() {
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = reconciler(&cluster);
        reconciler
            .reconcile(&target(42), Some(MANIFEST), Duration::from_secs(1))
            .await
            .unwrap();
        let report = reconciler
            .reconcile(&target(42), Some(MANIFEST), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.path(), "Present -> Stable");
        assert_eq!(report.outcome, ReconciliationOutcome::Stable);
        assert_eq!(cluster.mutations(), 1);
    }

    #[tokio::test]
    async fn test_rollout_waits_for_progress() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload("shop", "orders", "registry.example.com/orders:41", 3)
                .stable_after_polls(3),
        );
        let report = reconciler(&cluster)
            .reconcile(&target(42), None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(report.outcome, ReconciliationOutcome::Updated);
        assert!(cluster.status_polls() >= 3);
    }

    #[tokio::test]
    async fn test_rollout_timeout_is_reported() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload("shop", "orders", "registry.example.com/orders:41", 3)
                .never_stable(),
        );
        let report = reconciler(&cluster)
            .reconcile(&target(42), None, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(report.outcome, ReconciliationOutcome::RolloutFailed);
        assert_eq!(report.path(), "Present -> Updating -> RolloutFailed");
        assert!(report.detail.as_deref().unwrap().contains("timed out"));
        assert!(matches!(report.into_result(), Err(ReleaseError::RolloutFailed { .. })));
    }

    #[tokio::test]
    async fn test_cluster_reported_failure_ends_wait() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload("shop", "orders", "registry.example.com/orders:41", 3)
                .failing_rollout("progress deadline exceeded"),
        );
        let report = reconciler(&cluster)
            .reconcile(&target(42), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.outcome, ReconciliationOutcome::RolloutFailed);
        assert_eq!(report.detail.as_deref(), Some("progress deadline exceeded"));
        assert_eq!(cluster.status_polls(), 1);
    }

    #[tokio::test]
    async fn test_missing_container_fails() {
        let cluster = Arc::new(
            FakeCluster::new().with_workload("shop", "orders", "registry.example.com/orders:41", 1),
        );
        let mut target = target(42);
        target.container = "worker".to_string();
        let err = reconciler(&cluster)
            .reconcile(&target, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker"));
    }
}
