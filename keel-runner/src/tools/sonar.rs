//! SonarQube as the quality gate
//!
//! Analysis runs `sonar-scanner` in the checkout. The scanner leaves a
//! `report-task.txt` behind naming the background task on the server;
//! the gate is read once that task has been processed.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{ReleaseError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use super::run_checked;
use crate::quality::{AnalysisSummary, GateStatus, QualityGate};

const SCANNER: &str = "sonar-scanner";
const SONAR: &str = "sonarqube";
const REPORT_TASK: &str = ".scannerwork/report-task.txt";

pub struct SonarQualityGate {
    host: String,
    project_key: String,
    token: Option<String>,
    http: Client,
    poll_interval: Duration,
}

impl SonarQualityGate {
    pub fn new(host: impl Into<String>, project_key: impl Into<String>, token: Option<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            project_key: project_key.into(),
            token,
            http: Client::new(),
            poll_interval: Duration::from_secs(3),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.host, path);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.basic_auth(token, Some(""));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ReleaseError::tool(SONAR, format!("GET {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReleaseError::tool(SONAR, format!("GET {}: {} {}", url, status, body.trim())));
        }
        response
            .json()
            .await
            .map_err(|e| ReleaseError::tool(SONAR, format!("GET {}: invalid response: {}", url, e)))
    }
}

/// Parses the `key=value` lines of `report-task.txt`
pub fn parse_report_task(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    status: String,
    #[serde(default)]
    analysis_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusResponse {
    project_status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: String,
    #[serde(default)]
    conditions: Vec<GateCondition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GateCondition {
    status: String,
    metric_key: String,
    #[serde(default)]
    actual_value: Option<String>,
    #[serde(default)]
    error_threshold: Option<String>,
}

fn gate_status(status: &ProjectStatus) -> GateStatus {
    if status.status == "OK" {
        return GateStatus::Passed;
    }
    let failing: Vec<String> = status
        .conditions
        .iter()
        .filter(|c| c.status == "ERROR")
        .map(|c| {
            format!(
                "{} is {} (threshold {})",
                c.metric_key,
                c.actual_value.as_deref().unwrap_or("?"),
                c.error_threshold.as_deref().unwrap_or("?")
            )
        })
        .collect();
    GateStatus::Failed {
        reason: if failing.is_empty() {
            format!("gate status {}", status.status)
        } else {
            failing.join(", ")
        },
    }
}

#[async_trait]
impl QualityGate for SonarQualityGate {
    async fn analyze(&self, source_dir: &Path) -> Result<AnalysisSummary> {
        let mut command = Command::new(SCANNER);
        command
            .current_dir(source_dir)
            .arg(format!("-Dsonar.projectKey={}", self.project_key))
            .arg(format!("-Dsonar.host.url={}", self.host));
        if let Some(token) = &self.token {
            command.env("SONAR_TOKEN", token);
        }
        run_checked(SCANNER, &mut command).await?;

        let report = tokio::fs::read_to_string(source_dir.join(REPORT_TASK))
            .await
            .map(|contents| parse_report_task(&contents))
            .unwrap_or_default();
        let task_id = report.get("ceTaskId").cloned();
        info!(
            "Analysis of {} submitted (task {})",
            self.project_key,
            task_id.as_deref().unwrap_or("unknown")
        );
        Ok(AnalysisSummary {
            detail: format!("analysis submitted for {}", self.project_key),
            task_id,
        })
    }

    async fn wait_for_gate(&self, source_dir: &Path, timeout: Duration) -> Result<GateStatus> {
        let contents = tokio::fs::read_to_string(source_dir.join(REPORT_TASK))
            .await
            .map_err(|e| ReleaseError::tool(SONAR, format!("no analysis report in {}: {}", source_dir.display(), e)))?;
        let report = parse_report_task(&contents);
        let task_id = report
            .get("ceTaskId")
            .ok_or_else(|| ReleaseError::tool(SONAR, "analysis report has no ceTaskId"))?;

        let deadline = Instant::now() + timeout;
        let analysis_id = loop {
            let response: TaskResponse = self.get(&format!("/api/ce/task?id={}", task_id)).await?;
            match response.task.status.as_str() {
                "SUCCESS" => {
                    break response.task.analysis_id.ok_or_else(|| {
                        ReleaseError::tool(SONAR, "processed task has no analysis id")
                    })?;
                }
                "FAILED" | "CANCELED" => {
                    return Ok(GateStatus::Failed {
                        reason: response
                            .task
                            .error_message
                            .unwrap_or_else(|| format!("analysis task {}", response.task.status)),
                    });
                }
                other => debug!("Analysis task {} is {}", task_id, other),
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(ReleaseError::QualityGateFailed(format!(
                    "analysis not processed within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let response: ProjectStatusResponse = self
            .get(&format!("/api/qualitygates/project_status?analysisId={}", analysis_id))
            .await?;
        let status = gate_status(&response.project_status);
        info!("Quality gate for {}: {:?}", self.project_key, status);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_task() {
        let contents = "projectKey=orders\nserverUrl=https://sonar.example.com\nceTaskId=AYx-123\nceTaskUrl=https://sonar.example.com/api/ce/task?id=AYx-123\n";
        let report = parse_report_task(contents);
        assert_eq!(report.get("ceTaskId").map(String::as_str), Some("AYx-123"));
        assert_eq!(
            report.get("ceTaskUrl").map(String::as_str),
            Some("https://sonar.example.com/api/ce/task?id=AYx-123")
        );
    }

    #[test]
    fn test_gate_status_lists_failing_conditions() {
        let response: ProjectStatusResponse = serde_json::from_str(
            r#"{"projectStatus":{"status":"ERROR","conditions":[
                {"status":"OK","metricKey":"new_bugs","actualValue":"0"},
                {"status":"ERROR","metricKey":"new_coverage","actualValue":"41.2","errorThreshold":"80"}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(
            gate_status(&response.project_status),
            GateStatus::Failed {
                reason: "new_coverage is 41.2 (threshold 80)".to_string()
            }
        );
    }

    #[test]
    fn test_gate_status_ok() {
        let response: ProjectStatusResponse =
            serde_json::from_str(r#"{"projectStatus":{"status":"OK"}}"#).unwrap();
        assert_eq!(gate_status(&response.project_status), GateStatus::Passed);
    }

    #[tokio::test]
    async fn test_wait_without_analysis_report() {
        let dir = tempfile::tempdir().unwrap();
        let gate = SonarQualityGate::new("https://sonar.example.com/", "orders", None);
        assert_eq!(gate.host, "https://sonar.example.com");
        let err = gate
            .wait_for_gate(dir.path(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ToolFailed { .. }));
    }
}
