//! Aggregate pipeline report
//!
//! The report is the primary diagnostic artifact of a release: it lists every
//! stage that ran, names the first aborting stage, and determines the process
//! exit code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::BuildId;
use crate::domain::stage::{StageOutcome, StageResult};

/// Exit code of a release where every abort-on-failure stage succeeded
pub const EXIT_OK: i32 = 0;
/// Exit code of a release halted by an aborting stage
pub const EXIT_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub service: String,
    #[serde(default)]
    pub build_id: Option<BuildId>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<StageResult>,
}

impl PipelineReport {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            service: service.into(),
            build_id: None,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: StageResult) {
        self.results.push(result);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// The stage that halted the pipeline, if any
    pub fn first_abort(&self) -> Option<&StageResult> {
        self.results.iter().find(|r| r.is_aborting_failure())
    }

    /// True when no abort-on-failure stage failed
    pub fn succeeded(&self) -> bool {
        self.first_abort().is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { EXIT_OK } else { EXIT_FAILED }
    }

    /// All advisories across stages, prefixed with the stage name
    pub fn advisories(&self) -> Vec<String> {
        self.results
            .iter()
            .flat_map(|r| r.advisories.iter().map(move |a| format!("{}: {}", r.stage, a)))
            .collect()
    }

    /// Non-aborting failures (recorded, execution continued)
    pub fn tolerated_failures(&self) -> impl Iterator<Item = &StageResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == StageOutcome::Failed && !r.aborts_pipeline)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stage::{FailurePolicy, StageOutput};
    use crate::error::{ErrorKind, ReleaseError};

    fn build_failure() -> ReleaseError {
        ReleaseError::BuildFailed {
            image: "r.example.com/orders:42".to_string(),
            reason: "exit 1".to_string(),
        }
    }

    #[test]
    fn test_empty_report_succeeds() {
        let report = PipelineReport::new("orders");
        assert!(report.succeeded());
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_first_abort_names_stage_and_kind() {
        let mut report = PipelineReport::new("orders");
        report.push(StageResult::completed(
            "checkout",
            FailurePolicy::ABORT,
            StageOutput::success(),
            Utc::now(),
        ));
        report.push(StageResult::failed(
            "image-build",
            FailurePolicy::ABORT,
            &build_failure(),
            Utc::now(),
        ));

        let abort = report.first_abort().unwrap();
        assert_eq!(abort.stage, "image-build");
        assert_eq!(abort.error_kind, Some(ErrorKind::BuildFailed));
        assert_eq!(report.exit_code(), EXIT_FAILED);
    }

    #[test]
    fn test_tolerated_failure_keeps_exit_zero() {
        let mut report = PipelineReport::new("orders");
        report.push(StageResult::failed(
            "quality-gate",
            FailurePolicy::CONTINUE,
            &ReleaseError::QualityGateFailed("ERROR".to_string()),
            Utc::now(),
        ));
        assert!(report.succeeded());
        assert_eq!(report.tolerated_failures().count(), 1);
    }

    #[test]
    fn test_json_round_trip_preserves_verdict() {
        let mut report = PipelineReport::new("orders");
        report.build_id = Some(BuildId::new(42));
        report.push(StageResult::failed(
            "image-build",
            FailurePolicy::ABORT,
            &build_failure(),
            Utc::now(),
        ));
        report.finish();

        let json = report.to_json_pretty().unwrap();
        let parsed = PipelineReport::from_json(&json).unwrap();
        assert_eq!(parsed, report);
        assert!(!parsed.succeeded());
    }
}
