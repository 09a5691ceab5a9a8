//! The cluster HTTP client as [`ClusterApi`]

use async_trait::async_trait;
use keel_client::{ClientError, KubeClient};
use keel_core::domain::cluster::{NamespaceStatus, RolloutStatus, Workload};
use keel_core::{ReleaseError, Result};

use crate::reconciler::ClusterApi;

const CLUSTER_API: &str = "cluster-api";

fn api_error(e: ClientError) -> ReleaseError {
    ReleaseError::tool(CLUSTER_API, e.to_string())
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        Ok(self
            .get_deployment(namespace, name)
            .await
            .map_err(api_error)?
            .map(|deployment| deployment.to_workload(namespace)))
    }

    async fn apply_manifest(&self, namespace: &str, name: &str, document: &str) -> Result<()> {
        self.apply_deployment(namespace, name, document)
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn set_image(&self, namespace: &str, name: &str, container: &str, image: &str) -> Result<()> {
        self.set_container_image(namespace, name, container, image)
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn rollout_status(&self, namespace: &str, name: &str) -> Result<RolloutStatus> {
        self.deployment_rollout_status(namespace, name)
            .await
            .map_err(api_error)
    }

    async fn create_namespace(&self, namespace: &str) -> Result<NamespaceStatus> {
        KubeClient::create_namespace(self, namespace)
            .await
            .map_err(api_error)
    }
}
