//! Deployment endpoints (`apps/v1`)

use keel_core::domain::cluster::RolloutStatus;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::model::Deployment;
use crate::{FIELD_MANAGER, KubeClient};

const APPLY_PATCH_YAML: &str = "application/apply-patch+yaml";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

impl KubeClient {
    fn deployment_path(namespace: &str, name: &str) -> String {
        format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name)
    }

    /// Get a deployment, or `None` if it does not exist
    pub async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let url = self.url(&Self::deployment_path(namespace, name));
        let response = self.authorize(self.client.get(&url)).send().await?;

        match self.handle_response(response).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Server-side apply of a full deployment document
    ///
    /// Creates the deployment when it does not exist. The document is sent
    /// verbatim as YAML; the API server parses it.
    ///
    /// # Arguments
    /// * `namespace` - Target namespace
    /// * `name` - Deployment name (must match `metadata.name` in the document)
    /// * `document` - The manifest document
    pub async fn apply_deployment(
        &self,
        namespace: &str,
        name: &str,
        document: &str,
    ) -> Result<Deployment> {
        let url = format!(
            "{}?fieldManager={}&force=true",
            self.url(&Self::deployment_path(namespace, name)),
            FIELD_MANAGER
        );
        debug!("Applying deployment {}/{} ({} bytes)", namespace, name, document.len());

        let response = self
            .authorize(self.client.patch(&url))
            .header(CONTENT_TYPE, APPLY_PATCH_YAML)
            .body(document.to_string())
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Patch the image of a single container, leaving every other field alone
    pub async fn set_container_image(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<Deployment> {
        let url = format!(
            "{}?fieldManager={}",
            self.url(&Self::deployment_path(namespace, name)),
            FIELD_MANAGER
        );
        let patch = image_patch(container, image);
        debug!("Setting image of {}/{} container {} to {}", namespace, name, container, image);

        let response = self
            .authorize(self.client.patch(&url))
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(patch.to_string())
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Current rollout status of a deployment
    pub async fn deployment_rollout_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RolloutStatus> {
        let deployment = self
            .get_deployment(namespace, name)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("deployments/{}/{}", namespace, name)))?;
        Ok(deployment.rollout_status())
    }
}

/// Strategic merge patch touching only `containers[name].image`
fn image_patch(container: &str, image: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{ "name": container, "image": image }]
                }
            }
        }
    })
}
