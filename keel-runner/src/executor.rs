//! Stage execution
//!
//! Runs an ordered list of stages against a shared context. Each stage
//! carries its own failure policy: a failing stage whose policy aborts ends
//! the run, any other failure is recorded and the run moves on. A report is
//! always produced, whatever happened.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use chrono::Utc;
use keel_core::domain::report::PipelineReport;
use keel_core::domain::stage::{FailurePolicy, StageOutcome, StageOutput, StageResult};
use keel_core::Result;
use tracing::{Instrument, error, info, info_span, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A stage body: borrows the context mutably for the duration of the stage
pub type StageFn<C> = for<'c> fn(&'c mut C) -> BoxFuture<'c, Result<StageOutput>>;

pub struct Stage<C> {
    pub name: &'static str,
    pub policy: FailurePolicy,
    pub action: StageFn<C>,
}

impl<C> Stage<C> {
    /// A stage that aborts the run on failure
    pub fn new(name: &'static str, action: StageFn<C>) -> Self {
        Self {
            name,
            policy: FailurePolicy::ABORT,
            action,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record failures of this stage without stopping the run
    pub fn continue_on_failure(self) -> Self {
        self.with_policy(FailurePolicy::CONTINUE)
    }
}

pub struct StageExecutor<C> {
    stages: Vec<Stage<C>>,
}

impl<C: Send> StageExecutor<C> {
    pub fn new(stages: Vec<Stage<C>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Runs every stage in order until one fails with an aborting policy
    ///
    /// Stages after an aborting failure are not started and do not appear
    /// in the report.
    pub async fn run(&self, service: &str, context: &mut C) -> PipelineReport {
        let mut report = PipelineReport::new(service);
        info!(
            "Starting release of {} ({} stages, run {})",
            service,
            self.stages.len(),
            report.run_id
        );

        for stage in &self.stages {
            info!("Stage '{}' started", stage.name);
            let started_at = Utc::now();
            let clock = Instant::now();

            let span = info_span!("stage", stage = stage.name, service = service);
            let result = match (stage.action)(context).instrument(span).await {
                Ok(output) => {
                    match output.outcome {
                        StageOutcome::Skipped => info!(
                            "Stage '{}' skipped: {}",
                            stage.name,
                            output.detail.as_deref().unwrap_or("no reason given")
                        ),
                        _ => info!("Stage '{}' completed in {:?}", stage.name, clock.elapsed()),
                    }
                    for advisory in &output.advisories {
                        warn!("Stage '{}': {}", stage.name, advisory);
                    }
                    StageResult::completed(stage.name, stage.policy, output, started_at)
                }
                Err(e) => {
                    if stage.policy.abort_on_failure {
                        error!("Stage '{}' failed: {}", stage.name, e);
                    } else {
                        warn!("Stage '{}' failed, continuing: {}", stage.name, e);
                    }
                    StageResult::failed(stage.name, stage.policy, &e, started_at)
                }
            };

            let halt = result.is_aborting_failure();
            report.push(result);
            if halt {
                error!("Release of {} aborted at stage '{}'", service, stage.name);
                break;
            }
        }

        report.finish();
        if report.succeeded() {
            info!("Release of {} finished", service);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ReleaseError;
    use keel_core::domain::report::{EXIT_FAILED, EXIT_OK};
    use keel_core::error::ErrorKind;

    #[derive(Default)]
    struct Trace {
        visited: Vec<&'static str>,
    }

    fn checkout(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("checkout");
            Ok(StageOutput::success())
        })
    }

    fn build(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("build");
            Err(ReleaseError::BuildFailed {
                image: "r/orders:42".to_string(),
                reason: "exit status 1".to_string(),
            })
        })
    }

    fn scan(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("scan");
            Err(ReleaseError::AdvisoryFindingsPresent {
                target: "source".to_string(),
                summary: "3 low".to_string(),
            })
        })
    }

    fn publish(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("publish");
            Ok(StageOutput::success().with_advisory("failed to prune r/orders:3"))
        })
    }

    fn patch(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("patch");
            Ok(StageOutput::success())
        })
    }

    fn reconcile(ctx: &mut Trace) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            ctx.visited.push("reconcile");
            Ok(StageOutput::skipped("no cluster"))
        })
    }

    #[tokio::test]
    async fn test_aborting_failure_stops_run() {
        let executor = StageExecutor::new(vec![
            Stage::new("checkout", checkout),
            Stage::new("build", build),
            Stage::new("publish", publish),
            Stage::new("patch", patch),
            Stage::new("reconcile", reconcile),
        ]);
        let mut trace = Trace::default();

        let report = executor.run("orders", &mut trace).await;

        assert_eq!(trace.visited, vec!["checkout", "build"]);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].outcome, StageOutcome::Success);
        assert_eq!(report.results[1].outcome, StageOutcome::Failed);
        assert_eq!(report.results[1].error_kind, Some(ErrorKind::BuildFailed));
        assert_eq!(report.first_abort().unwrap().stage, "build");
        assert_eq!(report.exit_code(), EXIT_FAILED);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_continue_policy_records_and_moves_on() {
        let executor = StageExecutor::new(vec![
            Stage::new("checkout", checkout),
            Stage::new("scan", scan).continue_on_failure(),
            Stage::new("publish", publish),
            Stage::new("patch", patch),
        ]);
        let mut trace = Trace::default();

        let report = executor.run("orders", &mut trace).await;

        assert_eq!(trace.visited, vec!["checkout", "scan", "publish", "patch"]);
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.results[1].outcome, StageOutcome::Failed);
        assert!(!report.results[1].aborts_pipeline);
        assert_eq!(report.tolerated_failures().count(), 1);
        assert_eq!(report.exit_code(), EXIT_OK);
        assert_eq!(report.advisories(), vec!["publish: failed to prune r/orders:3"]);
    }

    #[tokio::test]
    async fn test_skipped_stage_is_not_a_failure() {
        let executor = StageExecutor::new(vec![
            Stage::new("checkout", checkout),
            Stage::new("reconcile", reconcile),
        ]);
        let mut trace = Trace::default();

        let report = executor.run("orders", &mut trace).await;

        assert_eq!(report.results[1].outcome, StageOutcome::Skipped);
        assert_eq!(report.results[1].detail.as_deref(), Some("no cluster"));
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_empty_pipeline_succeeds() {
        let executor: StageExecutor<Trace> = StageExecutor::new(Vec::new());
        let report = executor.run("orders", &mut Trace::default()).await;
        assert!(report.results.is_empty());
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_stage_names_keep_order() {
        let executor = StageExecutor::new(vec![
            Stage::new("checkout", checkout),
            Stage::new("build", build).with_policy(FailurePolicy::aborting(true)),
        ]);
        assert_eq!(executor.stage_names(), vec!["checkout", "build"]);
    }
}
