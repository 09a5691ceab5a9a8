//! Static analysis and quality gate seam

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::Result;

/// What an analysis run left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSummary {
    /// Server-side task processing the analysis, if the tool reported one
    pub task_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Passed,
    Failed { reason: String },
}

#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Runs static analysis over the checked-out source
    async fn analyze(&self, source_dir: &Path) -> Result<AnalysisSummary>;

    /// Waits for the server to compute the gate of the last analysis
    async fn wait_for_gate(&self, source_dir: &Path, timeout: Duration) -> Result<GateStatus>;
}
