//! Release configuration
//!
//! Loaded from a TOML file (usually `keel.toml`) with every section
//! optional; missing fields fall back to defaults. Credentials are never
//! part of this file, they are scoped from the environment at run time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::scan::Severity;
use crate::error::{ReleaseError, Result};

/// Complete configuration for releasing one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Logical service name; also the image repository name
    pub service: String,
    pub source: SourceConfig,
    pub workspace: WorkspaceConfig,
    pub registry: RegistryConfig,
    pub manifest: ManifestConfig,
    pub cluster: ClusterConfig,
    pub quality: QualityConfig,
    pub counter: CounterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Clone URL of the service's source repository
    pub repository: String,
    pub branch: String,
    /// Directory inside the checkout used as the image build context
    pub context_dir: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            branch: "main".to_string(),
            context_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory for checkouts; wiped by the workspace-reset stage
    pub root: PathBuf,
}

impl WorkspaceConfig {
    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".keel/workspace"),
        }
    }
}

/// How many previously published images of the service to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "keep", content = "count")]
pub enum RetentionPolicy {
    #[default]
    #[serde(rename = "all")]
    KeepAll,
    #[serde(rename = "none")]
    KeepNone,
    #[serde(rename = "last")]
    KeepLast(usize),
}

/// What to do when the build tag already exists in the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepublishPolicy {
    /// Fail the push; a tag is never re-pointed
    #[default]
    Reject,
    /// Push anyway, replacing the existing tag
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host plus optional path prefix, without scheme
    pub uri: String,
    pub retention: RetentionPolicy,
    pub republish: RepublishPolicy,
    /// Findings at or above this severity fail the publish stage
    pub scan_threshold: Option<Severity>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            retention: RetentionPolicy::default(),
            republish: RepublishPolicy::default(),
            scan_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Clone URL of the manifest (GitOps) repository
    pub repository: String,
    pub branch: String,
    /// Path of the deployment document inside the manifest repository
    pub path: PathBuf,
    pub author_name: String,
    pub author_email: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            branch: "main".to_string(),
            path: PathBuf::from("deployment.yaml"),
            author_name: "keel".to_string(),
            author_email: "keel@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name (informational, shown in logs and reports)
    pub name: String,
    pub region: String,
    /// Control-plane API base URL
    pub api_url: String,
    /// File holding a bearer token; falls back to KEEL_CLUSTER_TOKEN
    pub token_file: Option<PathBuf>,
    /// PEM bundle used to verify the API server
    pub ca_file: Option<PathBuf>,
    pub namespace: String,
    /// Workload name; defaults to the service name
    pub workload: Option<String>,
    /// Container inside the workload; defaults to the service name
    pub container: Option<String>,
    pub rollout_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl ClusterConfig {
    pub fn workload_name<'a>(&'a self, service: &'a str) -> &'a str {
        self.workload.as_deref().unwrap_or(service)
    }

    pub fn container_name<'a>(&'a self, service: &'a str) -> &'a str {
        self.container.as_deref().unwrap_or(service)
    }

    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            region: String::new(),
            api_url: "https://kubernetes.default.svc".to_string(),
            token_file: None,
            ca_file: None,
            namespace: "default".to_string(),
            workload: None,
            container: None,
            rollout_timeout_secs: 300,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Static-analysis server; quality stages are skipped when unset
    pub sonar_host: Option<String>,
    /// Project key; defaults to the service name
    pub project_key: Option<String>,
    /// Whether a failed quality gate aborts the release
    pub blocking: bool,
    pub gate_timeout_secs: u64,
}

impl QualityConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sonar_host: None,
            project_key: None,
            blocking: false,
            gate_timeout_secs: 300,
        }
    }
}

/// Where build identifiers come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CounterConfig {
    /// A build number provided by the invoking CI environment
    Env { variable: String },
    /// A shared directory of allocation markers
    File { directory: PathBuf },
}

impl Default for CounterConfig {
    fn default() -> Self {
        CounterConfig::Env {
            variable: "BUILD_NUMBER".to_string(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            source: SourceConfig::default(),
            workspace: WorkspaceConfig::default(),
            registry: RegistryConfig::default(),
            manifest: ManifestConfig::default(),
            cluster: ClusterConfig::default(),
            quality: QualityConfig::default(),
            counter: CounterConfig::default(),
        }
    }
}

impl ReleaseConfig {
    /// Loads configuration from a TOML file
    ///
    /// A missing file yields the defaults. The result is not validated here
    /// because callers usually apply command-line overrides first.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| ReleaseError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(invalid("service cannot be empty"));
        }

        if self.registry.uri.trim().is_empty() {
            return Err(invalid("registry.uri cannot be empty"));
        }

        if self.registry.uri.contains("://") {
            return Err(invalid("registry.uri must not include a scheme"));
        }

        if self.registry.retention == RetentionPolicy::KeepLast(0) {
            return Err(invalid(
                "registry.retention keep=last needs count > 0 (use keep=none instead)",
            ));
        }

        if self.manifest.path.as_os_str().is_empty() {
            return Err(invalid("manifest.path cannot be empty"));
        }

        if self.cluster.namespace.trim().is_empty() {
            return Err(invalid("cluster.namespace cannot be empty"));
        }

        if !self.cluster.api_url.starts_with("http://")
            && !self.cluster.api_url.starts_with("https://")
        {
            return Err(invalid("cluster.api_url must start with http:// or https://"));
        }

        if self.cluster.rollout_timeout_secs == 0 {
            return Err(invalid("cluster.rollout_timeout_secs must be greater than 0"));
        }

        if self.cluster.poll_interval_ms == 0 {
            return Err(invalid("cluster.poll_interval_ms must be greater than 0"));
        }

        if self.cluster.poll_interval() > self.cluster.rollout_timeout() {
            return Err(invalid(
                "cluster.poll_interval_ms must not exceed the rollout timeout",
            ));
        }

        if let CounterConfig::Env { variable } = &self.counter
            && variable.trim().is_empty()
        {
            return Err(invalid("counter.variable cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ReleaseError {
    ReleaseError::InvalidConfig(message.to_string())
}
