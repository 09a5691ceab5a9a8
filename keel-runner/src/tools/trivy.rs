//! Trivy as the vulnerability scanner

use std::path::Path;

use async_trait::async_trait;
use keel_core::domain::image::ImageReference;
use keel_core::domain::scan::{Findings, Severity};
use keel_core::{ReleaseError, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use super::run_checked;
use crate::publisher::VulnerabilityScanner;

const TRIVY: &str = "trivy";

#[derive(Debug, Default)]
pub struct TrivyScanner;

impl TrivyScanner {
    pub fn new() -> Self {
        Self
    }

    async fn scan(&self, mode: &str, target: &str) -> Result<Findings> {
        let output = run_checked(
            TRIVY,
            Command::new(TRIVY)
                .arg(mode)
                .arg("--quiet")
                .arg("--format")
                .arg("json")
                .arg(target),
        )
        .await?;
        let findings = parse_report(&output.stdout)?;
        info!("Scanned {} ({}): {}", target, mode, findings.summary());
        Ok(findings)
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(rename = "Results", default)]
    results: Vec<ReportResult>,
}

#[derive(Debug, Deserialize)]
struct ReportResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<Vulnerability>>,
}

#[derive(Debug, Deserialize)]
struct Vulnerability {
    #[serde(rename = "Severity", default)]
    severity: String,
}

/// Counts vulnerabilities by severity in a trivy JSON report
pub fn parse_report(json: &str) -> Result<Findings> {
    let report: Report = serde_json::from_str(json)
        .map_err(|e| ReleaseError::tool(TRIVY, format!("unexpected report format: {}", e)))?;

    let mut findings = Findings::new();
    for vulnerability in report
        .results
        .iter()
        .flat_map(|r| r.vulnerabilities.iter().flatten())
    {
        let severity = vulnerability
            .severity
            .parse::<Severity>()
            .unwrap_or(Severity::Unknown);
        findings.record(severity);
    }
    Ok(findings)
}

#[async_trait]
impl VulnerabilityScanner for TrivyScanner {
    async fn scan_filesystem(&self, path: &Path) -> Result<Findings> {
        self.scan("fs", &path.display().to_string()).await
    }

    async fn scan_image(&self, image: &ImageReference) -> Result<Findings> {
        self.scan("image", &image.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_severity() {
        let json = r#"{
            "SchemaVersion": 2,
            "ArtifactName": "registry.example.com/orders:42",
            "Results": [
                {
                    "Target": "alpine 3.19",
                    "Vulnerabilities": [
                        { "VulnerabilityID": "CVE-2024-0001", "Severity": "CRITICAL" },
                        { "VulnerabilityID": "CVE-2024-0002", "Severity": "LOW" }
                    ]
                },
                { "Target": "app/go.sum", "Vulnerabilities": null },
                { "Target": "Cargo.lock" },
                {
                    "Target": "package-lock.json",
                    "Vulnerabilities": [{ "VulnerabilityID": "GHSA-x", "Severity": "weird" }]
                }
            ]
        }"#;
        let findings = parse_report(json).unwrap();
        assert_eq!(findings.total(), 3);
        assert_eq!(findings.at_or_above(Severity::High), 1);
        assert_eq!(findings.counts.get(&Severity::Unknown), Some(&1));
    }

    #[test]
    fn test_clean_report() {
        let findings = parse_report(r#"{"SchemaVersion": 2}"#).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_garbage_report() {
        assert!(matches!(
            parse_report("<html>"),
            Err(ReleaseError::ToolFailed { .. })
        ));
    }
}
