//! Cluster reconciliation domain types
//!
//! The cluster is the source of truth for the current state of a workload;
//! the manifest document is the source of truth for its desired state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::image::ImageReference;
use crate::error::ReleaseError;

/// What a reconciliation run is trying to converge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTarget {
    pub namespace: String,
    pub workload: String,
    /// Container inside the workload whose image is managed
    pub container: String,
    pub desired_image: ImageReference,
}

impl fmt::Display for ReconciliationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.workload)
    }
}

/// A container entry of a workload's pod template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
}

/// Current state of a workload as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<ContainerSpec>,
    /// Desired replica count (may be owned by an autoscaler)
    pub replicas: Option<i32>,
}

impl Workload {
    /// Image currently configured for `container`
    pub fn image_of(&self, container: &str) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.name == container)
            .map(|c| c.image.as_str())
    }
}

/// Rollout progress of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutStatus {
    /// All replicas updated and available
    Complete,
    /// Still replacing instances
    Progressing {
        updated: i32,
        available: i32,
        desired: i32,
    },
    /// The cluster gave up on the rollout (e.g. progress deadline exceeded)
    Failed { reason: String },
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutStatus::Complete => write!(f, "complete"),
            RolloutStatus::Progressing {
                updated,
                available,
                desired,
            } => write!(
                f,
                "{}/{} updated, {}/{} available",
                updated, desired, available, desired
            ),
            RolloutStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of an idempotent namespace creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceStatus {
    Created,
    AlreadyExists,
}

/// States a workload passes through during one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileState {
    Absent,
    Present,
    Created,
    Updating,
    Stable,
    RolloutFailed,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileState::Absent => "Absent",
            ReconcileState::Present => "Present",
            ReconcileState::Created => "Created",
            ReconcileState::Updating => "Updating",
            ReconcileState::Stable => "Stable",
            ReconcileState::RolloutFailed => "RolloutFailed",
        };
        f.write_str(name)
    }
}

/// Final verdict of a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationOutcome {
    /// Workload was absent, created from the manifest and is now stable
    Created,
    /// Workload image was updated and the rollout stabilized
    Updated,
    /// Workload already ran the desired image and was stable
    Stable,
    /// The resource exists but did not stabilize in time
    RolloutFailed,
}

/// Record of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub target: ReconciliationTarget,
    pub transitions: Vec<ReconcileState>,
    pub outcome: ReconciliationOutcome,
    /// Last rollout status observed, or the failure reason
    pub detail: Option<String>,
}

impl ReconcileReport {
    /// Renders the state path, e.g. "Absent -> Created -> Stable"
    pub fn path(&self) -> String {
        self.transitions
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Turns a failed rollout into an error, passing every other outcome through
    pub fn into_result(self) -> Result<Self, ReleaseError> {
        if self.outcome != ReconciliationOutcome::RolloutFailed {
            return Ok(self);
        }
        Err(ReleaseError::RolloutFailed {
            namespace: self.target.namespace.clone(),
            workload: self.target.workload.clone(),
            image: self.target.desired_image.to_string(),
            reason: self
                .detail
                .unwrap_or_else(|| "rollout did not complete".to_string()),
        })
    }
}
