//! Wire model for the subset of the `apps/v1` Deployment object we read
//!
//! Every field is optional on the wire; missing fields deserialize to their
//! defaults so partially populated objects (e.g. right after creation, before
//! the controller has written a status) are still usable.

use keel_core::domain::cluster::{ContainerSpec, RolloutStatus, Workload};
use serde::{Deserialize, Serialize};

/// Reason the deployment controller sets when a rollout stalls
pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub generation: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub updated_replicas: Option<i32>,
    #[serde(default)]
    pub available_replicas: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<DeploymentCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Deployment {
    pub fn image_of(&self, container: &str) -> Option<&str> {
        self.spec
            .template
            .spec
            .containers
            .iter()
            .find(|c| c.name == container)
            .and_then(|c| c.image.as_deref())
    }

    /// Rollout progress, following the same rules as `kubectl rollout status`
    ///
    /// The rollout is complete only once the controller has observed the
    /// latest generation, every desired replica runs the new template, no old
    /// replicas remain, and every updated replica is available.
    pub fn rollout_status(&self) -> RolloutStatus {
        let status = self.status.clone().unwrap_or_default();
        let desired = self.spec.replicas.unwrap_or(1);
        let updated = status.updated_replicas.unwrap_or(0);
        let available = status.available_replicas.unwrap_or(0);
        let total = status.replicas.unwrap_or(0);
        let progressing = RolloutStatus::Progressing {
            updated,
            available,
            desired,
        };

        let generation = self.metadata.generation.unwrap_or(0);
        let observed = status.observed_generation.unwrap_or(-1);
        if observed < generation {
            return progressing;
        }

        if let Some(condition) = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "Progressing")
            && condition.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED)
        {
            return RolloutStatus::Failed {
                reason: condition
                    .message
                    .clone()
                    .unwrap_or_else(|| "progress deadline exceeded".to_string()),
            };
        }

        if updated < desired || total > updated || available < updated {
            return progressing;
        }

        RolloutStatus::Complete
    }

    /// Converts to the domain workload view
    pub fn to_workload(&self, namespace: &str) -> Workload {
        Workload {
            namespace: self
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: self.metadata.name.clone(),
            containers: self
                .spec
                .template
                .spec
                .containers
                .iter()
                .map(|c| ContainerSpec {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                })
                .collect(),
            replicas: self.spec.replicas,
        }
    }
}
