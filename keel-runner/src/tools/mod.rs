//! Process- and HTTP-backed implementations of the engine's seams
//!
//! - `podman`: image build and push, registry listing and deletion via skopeo
//! - `trivy`: filesystem and image vulnerability scans
//! - `git`: the git CLI as source control
//! - `sonar`: sonar-scanner analysis and the quality gate API
//! - `kube`: the cluster client as [`ClusterApi`](crate::reconciler::ClusterApi)

pub mod git;
pub mod kube;
pub mod podman;
pub mod sonar;
pub mod trivy;

use std::process::Stdio;

use keel_core::{ReleaseError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Captured output of a finished tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl ToolOutput {
    /// The tail of stderr (or stdout when stderr is empty), for error messages
    pub fn failure_summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = text.trim().lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        match self.code {
            Some(code) => format!("exit status {}: {}", code, tail),
            None => format!("terminated by signal: {}", tail),
        }
    }
}

/// Runs `command` to completion, optionally feeding `stdin`
///
/// A non-zero exit is not an error here; callers that only care about
/// success use [`run_checked`].
pub async fn run(tool: &str, command: &mut Command, stdin: Option<&str>) -> Result<ToolOutput> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ReleaseError::tool(tool, format!("failed to execute (is {} installed?): {}", tool, e)))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| ReleaseError::tool(tool, format!("failed to write stdin: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ReleaseError::tool(tool, format!("failed to wait for process: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !stdout.trim().is_empty() {
        debug!("{} stdout: {}", tool, stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", tool, stderr.trim());
    }

    Ok(ToolOutput {
        stdout,
        stderr,
        success: output.status.success(),
        code: output.status.code(),
    })
}

/// Like [`run`], but a non-zero exit becomes `ToolFailed`
pub async fn run_checked(tool: &str, command: &mut Command) -> Result<ToolOutput> {
    let output = run(tool, command, None).await?;
    if !output.success {
        return Err(ReleaseError::tool(tool, output.failure_summary()));
    }
    Ok(output)
}

/// Checks that `tool` is installed by asking for its version
pub async fn check_available(tool: &str) -> Result<()> {
    let output = run_checked(tool, Command::new(tool).arg("--version")).await?;
    info!("{} is available: {}", tool, output.stdout.lines().next().unwrap_or("").trim());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_summary_prefers_stderr_tail() {
        let output = ToolOutput {
            stdout: "building...".to_string(),
            stderr: "1\n2\n3\n4\n5\n6\nError: no such file\n".to_string(),
            success: false,
            code: Some(125),
        };
        assert_eq!(
            output.failure_summary(),
            "exit status 125: 3\n4\n5\n6\nError: no such file"
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_tool_failed() {
        let err = run("definitely-not-installed-keel", &mut Command::new("definitely-not-installed-keel"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ToolFailed { .. }));
    }
}
