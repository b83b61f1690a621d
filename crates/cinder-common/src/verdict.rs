// Aggregate outcome of one workflow run.

use crate::constants::return_code;
use crate::event::Event;
use crate::job_result::{JobOutcome, JobResult};
use serde::Serialize;
use uuid::Uuid;

/// The overall classification of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerdictKind {
    /// No job matched the event.
    NoOp,
    Success,
    Failure { failing_jobs: Vec<String> },
    /// Jobs were aborted and none failed.
    Cancelled { aborted_jobs: Vec<String> },
}

/// All job results for one event, plus their aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct RunVerdict {
    pub run_id: Uuid,
    pub workflow: String,
    pub event: Event,
    pub verdict: VerdictKind,
    pub results: Vec<JobResult>,
}

impl RunVerdict {
    pub fn no_op(run_id: Uuid, workflow: impl Into<String>, event: Event) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            event,
            verdict: VerdictKind::NoOp,
            results: Vec::new(),
        }
    }

    /// Aggregate job results.
    ///
    /// Any failed job makes the run a failure. Otherwise any aborted job makes
    /// it cancelled. A run is a success only when every job succeeded.
    pub fn from_results(
        run_id: Uuid,
        workflow: impl Into<String>,
        event: Event,
        results: Vec<JobResult>,
    ) -> Self {
        let names_with = |outcome: JobOutcome| -> Vec<String> {
            results
                .iter()
                .filter(|r| r.outcome == outcome)
                .map(|r| r.job_name.clone())
                .collect()
        };

        let failing_jobs = names_with(JobOutcome::Failure);
        let aborted_jobs = names_with(JobOutcome::Aborted);

        let verdict = if results.is_empty() {
            VerdictKind::NoOp
        } else if !failing_jobs.is_empty() {
            VerdictKind::Failure { failing_jobs }
        } else if !aborted_jobs.is_empty() {
            VerdictKind::Cancelled { aborted_jobs }
        } else {
            VerdictKind::Success
        };

        Self {
            run_id,
            workflow: workflow.into(),
            event,
            verdict,
            results,
        }
    }

    /// True for `Success` and `NoOp`.
    pub fn is_success(&self) -> bool {
        matches!(self.verdict, VerdictKind::Success | VerdictKind::NoOp)
    }

    pub fn is_no_op(&self) -> bool {
        self.verdict == VerdictKind::NoOp
    }

    pub fn failing_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Failure)
    }

    pub fn aborted_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Aborted)
    }

    /// Process exit code for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            VerdictKind::NoOp | VerdictKind::Success => return_code::SUCCESS,
            VerdictKind::Failure { .. } => return_code::RUN_FAILED,
            VerdictKind::Cancelled { .. } => return_code::RUN_CANCELLED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_result::{CacheStatus, FailureReason, StepFailure};
    use std::time::Duration;

    fn ok(name: &str) -> JobResult {
        JobResult::success(name, 1, Duration::from_millis(10), CacheStatus::Disabled)
    }

    fn failed(name: &str) -> JobResult {
        JobResult::failure(
            name,
            StepFailure::at_step(1, "step", FailureReason::ExitCode { code: 1 }, String::new()),
            0,
            Duration::from_millis(10),
            CacheStatus::Disabled,
        )
    }

    fn aborted(name: &str) -> JobResult {
        JobResult::aborted(name, None, 0, Duration::ZERO, CacheStatus::Disabled)
    }

    fn verdict(results: Vec<JobResult>) -> RunVerdict {
        RunVerdict::from_results(Uuid::new_v4(), "CI", Event::push("master"), results)
    }

    #[test]
    fn all_success_is_success() {
        let v = verdict(vec![ok("check"), ok("fmt")]);
        assert_eq!(v.verdict, VerdictKind::Success);
        assert!(v.is_success());
        assert_eq!(v.exit_code(), 0);
    }

    #[test]
    fn one_failure_fails_the_run_and_keeps_every_result() {
        let v = verdict(vec![ok("check"), failed("fmt"), ok("docs"), ok("tests")]);
        assert_eq!(
            v.verdict,
            VerdictKind::Failure {
                failing_jobs: vec!["fmt".into()]
            }
        );
        assert_eq!(v.results.len(), 4);
        assert_ne!(v.exit_code(), 0);
    }

    #[test]
    fn failure_wins_over_abort() {
        let v = verdict(vec![aborted("check"), failed("fmt")]);
        assert!(matches!(v.verdict, VerdictKind::Failure { .. }));
        assert_eq!(v.aborted_jobs().count(), 1);
        assert_eq!(v.exit_code(), return_code::RUN_FAILED);
    }

    #[test]
    fn aborted_without_failures_is_cancelled() {
        let v = verdict(vec![ok("check"), aborted("tests")]);
        assert_eq!(
            v.verdict,
            VerdictKind::Cancelled {
                aborted_jobs: vec!["tests".into()]
            }
        );
        assert!(!v.is_success());
        assert_eq!(v.exit_code(), return_code::RUN_CANCELLED);
    }

    #[test]
    fn no_op_exits_zero() {
        let v = RunVerdict::no_op(Uuid::new_v4(), "CI", Event::pull_request("gh-pages", "x"));
        assert!(v.is_no_op());
        assert!(v.is_success());
        assert_eq!(v.exit_code(), 0);
        assert_eq!(verdict(Vec::new()).verdict, VerdictKind::NoOp);
    }

    #[test]
    fn verdict_serializes_with_kind_tag() {
        let v = verdict(vec![failed("fmt")]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["verdict"]["kind"], "failure");
        assert_eq!(json["verdict"]["failing_jobs"][0], "fmt");
        assert_eq!(json["event"]["kind"], "push");
    }
}
