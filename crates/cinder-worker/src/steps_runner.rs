// StepsRunner: runs a job's steps strictly in order and stops at the first
// failure. Step output is streamed into the job log as it arrives.

use crate::environment::Environment;
use crate::step_runner::{StepRunner, StepStatus};
use cinder_common::constants::FAILURE_OUTPUT_TAIL_LINES;
use cinder_common::workflow::Job;
use cinder_common::{JobLogWriter, StepFailure};
use cinder_sdk::{OutputLine, OutputStream, TraceWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the step sequence ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepsTermination {
    /// Every step exited zero.
    Completed { steps: usize },
    /// A step failed; nothing after it ran.
    Failed { failure: StepFailure, completed: usize },
    /// Cancellation stopped the sequence. `step` is the step that was
    /// running, `None` when cancellation landed between steps.
    Cancelled { step: Option<String>, completed: usize },
}

impl StepsTermination {
    pub fn completed(&self) -> usize {
        match self {
            StepsTermination::Completed { steps } => *steps,
            StepsTermination::Failed { completed, .. } => *completed,
            StepsTermination::Cancelled { completed, .. } => *completed,
        }
    }
}

pub struct StepsRunner {
    runner: Arc<dyn StepRunner>,
    trace: Arc<dyn TraceWriter>,
}

impl StepsRunner {
    pub fn new(runner: Arc<dyn StepRunner>, trace: Arc<dyn TraceWriter>) -> Self {
        Self { runner, trace }
    }

    /// Run every step of `job` in `env`.
    ///
    /// The effective timeout of a step is its own, else the job's, else
    /// `default_timeout`.
    pub async fn run(
        &self,
        job: &Job,
        env: &mut Environment,
        default_timeout: Duration,
        cancel: CancellationToken,
        mut log: Option<&mut JobLogWriter>,
    ) -> StepsTermination {
        let total = job.steps.len();

        for (index, step) in job.steps.iter().enumerate() {
            let number = index + 1;
            if cancel.is_cancelled() {
                self.trace.info(&format!(
                    "Job '{}' cancelled before step '{}'",
                    job.name, step.name
                ));
                return StepsTermination::Cancelled {
                    step: None,
                    completed: index,
                };
            }

            let timeout = step.timeout.or(job.timeout).unwrap_or(default_timeout);
            self.trace
                .info(&format!("[{}] Step {}/{}: {}", job.name, number, total, step.name));
            if let Some(log) = log.as_deref_mut() {
                log.write(&format!("##[group]Step {number}/{total}: {}", step.name));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let (outcome, ()) = tokio::join!(
                self.runner
                    .run(step, env, timeout, cancel.clone(), Some(tx)),
                drain(rx, log.as_deref_mut()),
            );

            if let Some(log) = log.as_deref_mut() {
                log.write("##[endgroup]");
            }

            if outcome.status == StepStatus::Cancelled {
                self.trace
                    .info(&format!("[{}] Step '{}' was cancelled", job.name, step.name));
                return StepsTermination::Cancelled {
                    step: Some(step.name.clone()),
                    completed: index,
                };
            }

            if let Some(reason) = outcome.status.failure_reason() {
                self.trace.error(&format!(
                    "[{}] Step '{}' failed: {}",
                    job.name, step.name, reason
                ));
                if let Some(log) = log.as_deref_mut() {
                    log.write(&format!("##[error]Step '{}' failed: {}", step.name, reason));
                }
                return StepsTermination::Failed {
                    failure: StepFailure::at_step(
                        number,
                        &step.name,
                        reason,
                        outcome.output_tail(FAILURE_OUTPUT_TAIL_LINES),
                    ),
                    completed: index,
                };
            }

            self.trace.verbose(&format!(
                "[{}] Step '{}' succeeded in {:.1}s",
                job.name,
                step.name,
                outcome.duration.as_secs_f64()
            ));
        }

        StepsTermination::Completed { steps: total }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<OutputLine>, mut log: Option<&mut JobLogWriter>) {
    while let Some(line) = rx.recv().await {
        if let Some(log) = log.as_deref_mut() {
            match line.stream {
                OutputStream::Stdout => log.write(&line.text),
                OutputStream::Stderr => log.write(&format!("[stderr] {}", line.text)),
            }
        }
    }
}
