//! Release error taxonomy
//!
//! Every stage reports failures through [`ReleaseError`]. Whether a failure
//! stops the pipeline is decided by the stage's failure policy, not by the
//! error itself; [`ReleaseError::is_advisory`] only marks the kinds that are
//! informational by nature.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::scan::Severity;

/// Result type alias for release operations
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Errors that can occur while releasing a service
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The build counter could not produce an identifier
    #[error("build identifier unavailable: {0}")]
    AllocationUnavailable(String),

    /// Source checkout failed
    #[error("checkout of {repository} ({branch}) failed: {reason}")]
    CheckoutFailed {
        repository: String,
        branch: String,
        reason: String,
    },

    /// Required credentials are missing from the environment
    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    /// The static-analysis quality gate did not pass
    #[error("quality gate failed: {0}")]
    QualityGateFailed(String),

    /// Image build failed
    #[error("image build for {image} failed: {reason}")]
    BuildFailed { image: String, reason: String },

    /// Registry login or push failed
    #[error("push of {image} failed: {reason}")]
    PushFailed { image: String, reason: String },

    /// Scan findings crossed the configured blocking threshold
    #[error("{count} finding(s) at or above {threshold} in {target}")]
    ScanThresholdExceeded {
        target: String,
        threshold: Severity,
        count: u32,
    },

    /// Scan findings recorded without blocking
    #[error("advisory findings in {target}: {summary}")]
    AdvisoryFindingsPresent { target: String, summary: String },

    /// No image reference for the service exists in the manifest
    #[error("no image reference for '{service}' found in {path}")]
    ManifestAnchorNotFound { path: String, service: String },

    /// More than one image reference for the service exists in the manifest
    #[error("{} image references for '{service}' in {path} (lines {}), refusing to pick one", .lines.len(), format_lines(.lines))]
    ManifestAmbiguous {
        path: String,
        service: String,
        lines: Vec<usize>,
    },

    /// The manifest push kept being rejected by a concurrent update
    #[error("manifest push of tag {tag} to {branch} conflicted: {reason}")]
    ManifestPushConflict {
        branch: String,
        tag: String,
        reason: String,
    },

    /// A cluster create/update call failed
    #[error("cluster apply to {namespace}/{workload} failed: {reason}")]
    ClusterApplyFailed {
        namespace: String,
        workload: String,
        reason: String,
    },

    /// The workload exists but did not stabilize on the desired image
    #[error("rollout of {namespace}/{workload} to {image} did not stabilize: {reason}")]
    RolloutFailed {
        namespace: String,
        workload: String,
        image: String,
        reason: String,
    },

    /// An external tool exited unsuccessfully or produced unusable output
    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stage ran without the output of a stage it depends on
    #[error("missing stage input: {0}")]
    MissingStageInput(&'static str),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_lines(lines: &[usize]) -> String {
    lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ReleaseError {
    /// Create a tool failure from a tool name and a reason
    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Stable kind of this error, as named in the report
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationUnavailable(_) => ErrorKind::AllocationUnavailable,
            Self::CheckoutFailed { .. } => ErrorKind::CheckoutFailed,
            Self::CredentialsUnavailable(_) => ErrorKind::CredentialsUnavailable,
            Self::QualityGateFailed(_) => ErrorKind::QualityGateFailed,
            Self::BuildFailed { .. } => ErrorKind::BuildFailed,
            Self::PushFailed { .. } => ErrorKind::PushFailed,
            Self::ScanThresholdExceeded { .. } => ErrorKind::ScanThresholdExceeded,
            Self::AdvisoryFindingsPresent { .. } => ErrorKind::AdvisoryFindingsPresent,
            Self::ManifestAnchorNotFound { .. } => ErrorKind::ManifestAnchorNotFound,
            Self::ManifestAmbiguous { .. } => ErrorKind::ManifestAmbiguous,
            Self::ManifestPushConflict { .. } => ErrorKind::ManifestPushConflict,
            Self::ClusterApplyFailed { .. } => ErrorKind::ClusterApplyFailed,
            Self::RolloutFailed { .. } => ErrorKind::RolloutFailed,
            Self::ToolFailed { .. } => ErrorKind::ToolFailed,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::MissingStageInput(_) => ErrorKind::MissingStageInput,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error is informational by nature
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::AdvisoryFindingsPresent { .. })
    }
}

/// Serializable error kind used in stage results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AllocationUnavailable,
    CheckoutFailed,
    CredentialsUnavailable,
    QualityGateFailed,
    BuildFailed,
    PushFailed,
    ScanThresholdExceeded,
    AdvisoryFindingsPresent,
    ManifestAnchorNotFound,
    ManifestAmbiguous,
    ManifestPushConflict,
    ClusterApplyFailed,
    RolloutFailed,
    ToolFailed,
    InvalidConfig,
    MissingStageInput,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_taxonomy() {
        let err = ReleaseError::ManifestAnchorNotFound {
            path: "deploy.yaml".to_string(),
            service: "orders".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ManifestAnchorNotFound);
        assert_eq!(err.kind().to_string(), "ManifestAnchorNotFound");
    }

    #[test]
    fn test_ambiguous_lists_lines() {
        let err = ReleaseError::ManifestAmbiguous {
            path: "deploy.yaml".to_string(),
            service: "orders".to_string(),
            lines: vec![12, 30],
        };
        let message = err.to_string();
        assert!(message.contains("2 image references"));
        assert!(message.contains("lines 12, 30"));
    }

    #[test]
    fn test_only_findings_are_advisory() {
        let advisory = ReleaseError::AdvisoryFindingsPresent {
            target: "src".to_string(),
            summary: "1 high".to_string(),
        };
        assert!(advisory.is_advisory());
        assert!(!ReleaseError::AllocationUnavailable("down".to_string()).is_advisory());
    }
}
