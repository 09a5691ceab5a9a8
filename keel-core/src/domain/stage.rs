//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, ReleaseError};

/// Outcome of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "Success"),
            StageOutcome::Failed => write!(f, "Failed"),
            StageOutcome::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Whether a failing stage halts the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub abort_on_failure: bool,
}

impl FailurePolicy {
    /// Fail fast (the default for every stage)
    pub const ABORT: Self = Self {
        abort_on_failure: true,
    };

    /// Record the failure and keep going
    pub const CONTINUE: Self = Self {
        abort_on_failure: false,
    };

    pub fn aborting(abort_on_failure: bool) -> Self {
        Self { abort_on_failure }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::ABORT
    }
}

/// What a stage action returns when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub outcome: StageOutcome,
    pub detail: Option<String>,
    /// Non-fatal diagnostics (prune failures, scan findings)
    pub advisories: Vec<String>,
}

impl StageOutput {
    pub fn success() -> Self {
        Self {
            outcome: StageOutcome::Success,
            detail: None,
            advisories: Vec::new(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Skipped,
            detail: Some(reason.into()),
            advisories: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_advisory(mut self, advisory: impl Into<String>) -> Self {
        self.advisories.push(advisory.into());
        self
    }

    pub fn with_advisories(mut self, advisories: impl IntoIterator<Item = String>) -> Self {
        self.advisories.extend(advisories);
        self
    }
}

/// Recorded result of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub outcome: StageOutcome,
    /// The stage's failure policy at the time it ran
    pub aborts_pipeline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn completed(
        stage: impl Into<String>,
        policy: FailurePolicy,
        output: StageOutput,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: stage.into(),
            outcome: output.outcome,
            aborts_pipeline: policy.abort_on_failure,
            error_kind: None,
            error: None,
            detail: output.detail,
            advisories: output.advisories,
            started_at,
            duration_ms: elapsed_ms(started_at),
        }
    }

    pub fn failed(
        stage: impl Into<String>,
        policy: FailurePolicy,
        error: &ReleaseError,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage: stage.into(),
            outcome: StageOutcome::Failed,
            aborts_pipeline: policy.abort_on_failure,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            detail: None,
            advisories: Vec::new(),
            started_at,
            duration_ms: elapsed_ms(started_at),
        }
    }

    /// A failure whose policy halts the pipeline
    pub fn is_aborting_failure(&self) -> bool {
        self.outcome == StageOutcome::Failed && self.aborts_pipeline
    }
}

fn elapsed_ms(started_at: DateTime<Utc>) -> u64 {
    Utc::now()
        .signed_duration_since(started_at)
        .num_milliseconds()
        .max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_carries_kind() {
        let err = ReleaseError::BuildFailed {
            image: "r.example.com/orders:42".to_string(),
            reason: "exit 1".to_string(),
        };
        let result = StageResult::failed("image-build", FailurePolicy::ABORT, &err, Utc::now());
        assert_eq!(result.outcome, StageOutcome::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::BuildFailed));
        assert!(result.is_aborting_failure());
    }

    #[test]
    fn test_non_aborting_failure() {
        let err = ReleaseError::QualityGateFailed("coverage below 80%".to_string());
        let result = StageResult::failed("quality-gate", FailurePolicy::CONTINUE, &err, Utc::now());
        assert!(!result.is_aborting_failure());
    }

    #[test]
    fn test_completed_keeps_advisories() {
        let output = StageOutput::success().with_advisory("prune failed: timeout");
        let result = StageResult::completed("image-publish", FailurePolicy::ABORT, output, Utc::now());
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.advisories, vec!["prune failed: timeout".to_string()]);
    }
}
