//! Keel Cluster Client
//!
//! A small, typed HTTP client for the cluster control plane. It covers only
//! what a release needs: reading, applying and image-patching `apps/v1`
//! Deployments, reading their rollout status, and creating namespaces.
//!
//! # Example
//!
//! ```no_run
//! use keel_client::KubeClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_client::ClientError> {
//!     let client = KubeClient::new("https://kubernetes.example.com").with_token("secret");
//!
//!     if let Some(deployment) = client.get_deployment("shop", "orders").await? {
//!         println!("orders runs {:?}", deployment.image_of("orders"));
//!     }
//!     Ok(())
//! }
//! ```

mod deployments;
pub mod error;
pub mod model;
mod namespaces;

pub use error::{ClientError, Result};
pub use model::Deployment;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// Field manager name recorded by the API server for our changes
pub const FIELD_MANAGER: &str = "keel";

/// HTTP client for the cluster control-plane API
#[derive(Debug, Clone)]
pub struct KubeClient {
    /// Base URL of the API server (e.g., "https://10.0.0.1:6443")
    base_url: String,
    /// Bearer token sent with every request
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl KubeClient {
    /// Create a new client with default HTTP settings
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Create a client that trusts the given PEM bundle
    ///
    /// # Arguments
    /// * `base_url` - API server URL
    /// * `ca_pem` - PEM-encoded certificate(s) of the cluster CA
    pub fn with_ca_bundle(base_url: impl Into<String>, ca_pem: &[u8]) -> Result<Self> {
        let certificate = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| ClientError::InvalidConfig(format!("invalid CA bundle: {}", e)))?;
        let client = Client::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|e| ClientError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Attach a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.trim();
        self.token = if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        };
        self
    }

    /// Get the base URL of the API server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response whose body is not needed
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
