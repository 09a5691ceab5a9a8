//! Namespace endpoints (`core/v1`)

use keel_core::domain::cluster::NamespaceStatus;
use serde_json::json;

use crate::KubeClient;
use crate::error::Result;

impl KubeClient {
    /// Create a namespace, treating "already exists" as success
    pub async fn create_namespace(&self, name: &str) -> Result<NamespaceStatus> {
        let url = self.url("/api/v1/namespaces");
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        });
        let response = self.authorize(self.client.post(&url)).json(&body).send().await?;

        match self.handle_empty_response(response).await {
            Ok(()) => {
                tracing::info!("Created namespace {}", name);
                Ok(NamespaceStatus::Created)
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!("Namespace {} already exists", name);
                Ok(NamespaceStatus::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }
}
