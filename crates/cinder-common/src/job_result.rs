// Per-job outcome records produced by the job executor.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Terminal outcome of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    Aborted,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "Succeeded"),
            JobOutcome::Failure => write!(f, "Failed"),
            JobOutcome::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The step's process exited non-zero.
    ExitCode { code: i32 },
    /// The step exceeded its timeout and was killed.
    TimedOut {
        #[serde(rename = "after_secs", serialize_with = "serialize_secs")]
        after: Duration,
    },
    /// The step's interpreter could not be started.
    SpawnFailed { message: String },
    /// Workspace preparation or cache restore failed before step 1.
    EnvironmentSetup { message: String },
    /// The executor task itself died.
    Panicked { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exit code {code}"),
            FailureReason::TimedOut { after } => {
                write!(f, "timed out after {:.1}s", after.as_secs_f64())
            }
            FailureReason::SpawnFailed { message } => write!(f, "failed to start: {message}"),
            FailureReason::EnvironmentSetup { message } => {
                write!(f, "environment setup failed: {message}")
            }
            FailureReason::Panicked { message } => write!(f, "executor crashed: {message}"),
        }
    }
}

/// Pointer to the first failing step of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    /// `None` when the job failed before its first step.
    pub step: Option<String>,
    /// 1-based position of the step in the job.
    pub step_index: Option<usize>,
    pub reason: FailureReason,
    /// Last lines of the step's output.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

impl StepFailure {
    pub fn at_step(index: usize, name: &str, reason: FailureReason, output_tail: String) -> Self {
        Self {
            step: Some(name.to_string()),
            step_index: Some(index),
            reason,
            output_tail,
        }
    }

    pub fn before_steps(reason: FailureReason) -> Self {
        Self {
            step: None,
            step_index: None,
            reason,
            output_tail: String::new(),
        }
    }
}

/// How the cache participated in a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Disabled,
    Hit,
    Miss,
}

/// Result of one job run. Exactly one exists per executed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub job_name: String,
    pub outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Step that was running when the job was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_step: Option<String>,
    pub steps_completed: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub cache: CacheStatus,
}

impl JobResult {
    pub fn success(
        job_name: impl Into<String>,
        steps_completed: usize,
        duration: Duration,
        cache: CacheStatus,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            outcome: JobOutcome::Success,
            failure: None,
            aborted_step: None,
            steps_completed,
            duration,
            cache,
        }
    }

    pub fn failure(
        job_name: impl Into<String>,
        failure: StepFailure,
        steps_completed: usize,
        duration: Duration,
        cache: CacheStatus,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            outcome: JobOutcome::Failure,
            failure: Some(failure),
            aborted_step: None,
            steps_completed,
            duration,
            cache,
        }
    }

    pub fn aborted(
        job_name: impl Into<String>,
        aborted_step: Option<String>,
        steps_completed: usize,
        duration: Duration,
        cache: CacheStatus,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            outcome: JobOutcome::Aborted,
            failure: None,
            aborted_step,
            steps_completed,
            duration,
            cache,
        }
    }

    /// Result for a job whose executor task panicked or was lost.
    pub fn crashed(job_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(
            job_name,
            StepFailure::before_steps(FailureReason::Panicked {
                message: message.into(),
            }),
            0,
            Duration::ZERO,
            CacheStatus::Disabled,
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Success
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
