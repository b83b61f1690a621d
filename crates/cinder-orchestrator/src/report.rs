// Human-readable and JSON renderings of a RunVerdict.

use anyhow::Result;
use cinder_common::{CacheStatus, JobOutcome, JobResult, RunVerdict, VerdictKind};
use std::fmt::Write;
use std::path::Path;

const TAIL_INDENT: &str = "      | ";

/// Render the verdict for a terminal. Every failing job is named together
/// with its first failing step; aborted jobs are listed on their own.
pub fn render(verdict: &RunVerdict) -> String {
    let mut out = String::new();
    let headline = match &verdict.verdict {
        VerdictKind::NoOp => "NO-OP (no job matched)",
        VerdictKind::Success => "SUCCESS",
        VerdictKind::Failure { .. } => "FAILURE",
        VerdictKind::Cancelled { .. } => "CANCELLED",
    };
    let _ = writeln!(
        out,
        "Workflow '{}' for {} (run {}): {}",
        verdict.workflow,
        verdict.event,
        verdict.run_id.as_simple(),
        headline
    );

    let width = verdict
        .results
        .iter()
        .map(|r| r.job_name.len())
        .max()
        .unwrap_or(0);
    for result in &verdict.results {
        render_job(&mut out, result, width);
    }

    let failing: Vec<&str> = verdict.failing_jobs().map(|r| r.job_name.as_str()).collect();
    if !failing.is_empty() {
        let _ = writeln!(out, "Failing jobs: {}", failing.join(", "));
    }
    let aborted: Vec<&str> = verdict.aborted_jobs().map(|r| r.job_name.as_str()).collect();
    if !aborted.is_empty() {
        let _ = writeln!(out, "Aborted jobs: {}", aborted.join(", "));
    }
    out
}

fn render_job(out: &mut String, result: &JobResult, width: usize) {
    let cache = match result.cache {
        CacheStatus::Disabled => "",
        CacheStatus::Hit => ", cache hit",
        CacheStatus::Miss => ", cache miss",
    };
    let _ = write!(
        out,
        "  {:<width$}  {:<9} {:>7.1}s",
        result.job_name,
        result.outcome.to_string(),
        result.duration.as_secs_f64(),
        width = width
    );

    match result.outcome {
        JobOutcome::Success => {
            let _ = writeln!(out, "  ({} steps{})", result.steps_completed, cache);
        }
        JobOutcome::Aborted => match &result.aborted_step {
            Some(step) => {
                let _ = writeln!(out, "  during step '{step}'");
            }
            None => {
                let _ = writeln!(out, "  before its next step");
            }
        },
        JobOutcome::Failure => {
            let Some(failure) = &result.failure else {
                let _ = writeln!(out);
                return;
            };
            match (&failure.step, failure.step_index) {
                (Some(step), Some(index)) => {
                    let _ = writeln!(out, "  step {index} '{step}': {}", failure.reason);
                }
                _ => {
                    let _ = writeln!(out, "  before the first step: {}", failure.reason);
                }
            }
            for line in failure.output_tail.lines() {
                let _ = writeln!(out, "{TAIL_INDENT}{line}");
            }
        }
    }
}

/// Write the verdict as pretty JSON.
pub fn write_json(verdict: &RunVerdict, path: &Path) -> Result<()> {
    cinder_sdk::IOUtil::save_object(path, verdict)
}
