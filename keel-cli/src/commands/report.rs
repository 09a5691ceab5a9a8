//! `keel report`

use std::path::Path;

use anyhow::{Context, Result};
use keel_core::domain::report::PipelineReport;

use crate::render::print_report;

/// Prints a saved report; exits like the release it describes
pub fn handle_report(path: &Path) -> Result<i32> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let report = PipelineReport::from_json(&contents)
        .with_context(|| format!("{} is not a release report", path.display()))?;
    print_report(&report);
    Ok(report.exit_code())
}
