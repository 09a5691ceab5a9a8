//! Terminal rendering of pipeline reports

use colored::*;
use keel_core::domain::report::PipelineReport;
use keel_core::domain::stage::{StageOutcome, StageResult};

/// Print a report: one line per stage, advisories, then the verdict
pub fn print_report(report: &PipelineReport) {
    let build = report
        .build_id
        .map(|b| format!("build {}", b))
        .unwrap_or_else(|| "no build id".to_string());
    println!(
        "{} {} ({})  {}",
        "Release of".bold(),
        report.service.bold(),
        build,
        report.run_id.to_string().dimmed()
    );
    println!(
        "  Started:  {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = report.finished_at {
        let duration = finished.signed_duration_since(report.started_at);
        println!(
            "  Finished: {} ({}s)",
            finished.format("%Y-%m-%d %H:%M:%S"),
            duration.num_seconds()
        );
    }
    println!();

    for result in &report.results {
        print_stage(result);
    }

    let advisories = report.advisories();
    if !advisories.is_empty() {
        println!("\n{}", "Advisories:".bold());
        for advisory in advisories {
            println!("  {} {}", "!".yellow(), advisory);
        }
    }

    println!();
    match report.first_abort() {
        None => println!("{}", "✓ Release succeeded".green().bold()),
        Some(abort) => println!(
            "{} at stage '{}' ({})",
            "✗ Release failed".red().bold(),
            abort.stage,
            abort
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ),
    }
}

fn print_stage(result: &StageResult) {
    let marker = match result.outcome {
        StageOutcome::Success => "✓".green(),
        StageOutcome::Skipped => "-".dimmed(),
        StageOutcome::Failed if result.aborts_pipeline => "✗".red(),
        StageOutcome::Failed => "!".yellow(),
    };
    println!(
        "  {} {:<18} {}",
        marker,
        result.stage,
        format!("{}ms", result.duration_ms).dimmed()
    );
    if let Some(detail) = &result.detail {
        println!("      {}", detail.dimmed());
    }
    if let Some(error) = &result.error {
        let line = match result.error_kind {
            Some(kind) => format!("{}: {}", kind, error),
            None => error.clone(),
        };
        if result.aborts_pipeline {
            println!("      {}", line.red());
        } else {
            println!("      {}", line.yellow());
        }
    }
}
