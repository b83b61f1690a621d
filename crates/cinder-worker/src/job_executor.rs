// JobExecutor: drives one job run through
// Pending -> Preparing -> Running -> {Succeeded | Failed | Aborted}
// and always produces exactly one JobResult.

use crate::cache::{CacheError, CacheKey, CacheStore, Snapshot};
use crate::environment::Environment;
use crate::step_runner::StepRunner;
use crate::steps_runner::{StepsRunner, StepsTermination};
use cinder_common::constants::variables;
use cinder_common::workflow::{CachePolicy, Job};
use cinder_common::{
    CacheStatus, Event, EventKind, FailureReason, JobLogWriter, JobResult, StepFailure,
};
use cinder_sdk::TraceWriter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "Pending",
            JobState::Preparing => "Preparing",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Parent of every per-run job directory.
    pub work_dir: PathBuf,
    /// Where `<run-id>/<job>.log` files go. `None` disables job logs.
    pub diag_dir: Option<PathBuf>,
    pub default_step_timeout: Duration,
    /// Leave job directories on disk after the run.
    pub keep_workspaces: bool,
}

/// Per-run inputs shared by every job of the run.
#[derive(Debug, Clone)]
pub struct JobRunContext {
    pub run_id: Uuid,
    pub event: Event,
    /// Checkout copied into each job workspace.
    pub source: Option<PathBuf>,
    pub workflow_env: BTreeMap<String, String>,
}

pub struct JobExecutor {
    config: JobExecutorConfig,
    cache: Arc<dyn CacheStore>,
    steps: StepsRunner,
    trace: Arc<dyn TraceWriter>,
}

/// What the preparing phase learned about the cache.
struct CacheLookup {
    status: CacheStatus,
    key: Option<CacheKey>,
}

impl JobExecutor {
    pub fn new(
        config: JobExecutorConfig,
        cache: Arc<dyn CacheStore>,
        step_runner: Arc<dyn StepRunner>,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            config,
            cache,
            steps: StepsRunner::new(step_runner, trace.clone()),
            trace,
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Run `job` to a terminal state. Never fails: every problem ends up in
    /// the returned [`JobResult`].
    pub async fn execute(
        &self,
        job: &Job,
        context: &JobRunContext,
        cancel: CancellationToken,
    ) -> JobResult {
        let started = Instant::now();
        let mut state = JobState::Pending;
        self.transition(job, &mut state, JobState::Preparing);

        let mut env = match self.prepare(job, context).await {
            Ok(env) => env,
            Err(message) => {
                self.transition(job, &mut state, JobState::Failed);
                return JobResult::failure(
                    &job.name,
                    StepFailure::before_steps(FailureReason::EnvironmentSetup { message }),
                    0,
                    started.elapsed(),
                    CacheStatus::Disabled,
                );
            }
        };

        let lookup = match &job.cache {
            Some(policy) => match self.restore_cache(job, policy, &env).await {
                Ok(lookup) => lookup,
                Err(e) => {
                    self.trace
                        .error(&format!("[{}] Cache restore failed: {}", job.name, e));
                    self.transition(job, &mut state, JobState::Failed);
                    self.teardown(env).await;
                    return JobResult::failure(
                        &job.name,
                        StepFailure::before_steps(FailureReason::EnvironmentSetup {
                            message: format!("cache restore failed: {e}"),
                        }),
                        0,
                        started.elapsed(),
                        CacheStatus::Miss,
                    );
                }
            },
            None => CacheLookup {
                status: CacheStatus::Disabled,
                key: None,
            },
        };

        if cancel.is_cancelled() {
            self.transition(job, &mut state, JobState::Aborted);
            self.teardown(env).await;
            return JobResult::aborted(&job.name, None, 0, started.elapsed(), lookup.status);
        }

        let mut log = self.open_log(job, context);
        self.transition(job, &mut state, JobState::Running);
        let termination = self
            .steps
            .run(
                job,
                &mut env,
                self.config.default_step_timeout,
                cancel,
                log.as_mut(),
            )
            .await;

        let result = match termination {
            StepsTermination::Completed { steps } => {
                self.transition(job, &mut state, JobState::Succeeded);
                if let (Some(key), Some(policy)) = (&lookup.key, &job.cache) {
                    self.save_cache(job, key, policy, &env).await;
                }
                JobResult::success(&job.name, steps, started.elapsed(), lookup.status)
            }
            StepsTermination::Failed { failure, completed } => {
                self.transition(job, &mut state, JobState::Failed);
                JobResult::failure(&job.name, failure, completed, started.elapsed(), lookup.status)
            }
            StepsTermination::Cancelled { step, completed } => {
                self.transition(job, &mut state, JobState::Aborted);
                JobResult::aborted(&job.name, step, completed, started.elapsed(), lookup.status)
            }
        };

        if let Some(log) = log.as_mut() {
            log.write(&format!(
                "Job '{}' finished: {} in {:.1}s",
                job.name,
                result.outcome,
                result.duration.as_secs_f64()
            ));
            log.end();
        }

        self.teardown(env).await;
        result
    }

    fn transition(&self, job: &Job, state: &mut JobState, next: JobState) {
        self.trace
            .verbose(&format!("[{}] {} -> {}", job.name, state, next));
        if next.is_terminal() {
            self.trace.info(&format!("[{}] {}", job.name, next));
        }
        *state = next;
    }

    /// Build the isolated environment and seed its variables. Workflow env
    /// is overlaid by job env; the `CINDER_*` variables always win.
    async fn prepare(&self, job: &Job, context: &JobRunContext) -> Result<Environment, String> {
        let work_dir = self.config.work_dir.clone();
        let run_id = context.run_id;
        let name = job.name.clone();
        let source = context.source.clone();

        let mut env = tokio::task::spawn_blocking(move || {
            Environment::prepare(&work_dir, run_id, &name, source.as_deref())
        })
        .await
        .map_err(|e| format!("environment task failed: {e}"))?
        .map_err(|e| e.to_string())?;

        env.extend_vars(&context.workflow_env);
        env.extend_vars(&job.env);

        let workspace = env.workspace().to_string_lossy().into_owned();
        let temp = env.temp().to_string_lossy().into_owned();
        env.set_var(variables::CI, "true");
        env.set_var(variables::JOB, job.name.as_str());
        env.set_var(variables::RUN_ID, run_id.to_string());
        env.set_var(variables::WORKSPACE, workspace);
        env.set_var(variables::TEMP, temp);
        env.set_var(variables::EVENT_NAME, context.event.kind.as_str());
        env.set_var(variables::REF_NAME, context.event.branch.as_str());
        if context.event.kind == EventKind::PullRequest {
            if let Some(head) = &context.event.source_branch {
                env.set_var(variables::HEAD_REF, head.as_str());
            }
        }

        self.trace.verbose(&format!(
            "[{}] Workspace prepared at '{}'",
            job.name,
            env.workspace().display()
        ));
        Ok(env)
    }

    /// Derive the key from the freshly prepared workspace, then restore on a hit.
    async fn restore_cache(
        &self,
        job: &Job,
        policy: &CachePolicy,
        env: &Environment,
    ) -> Result<CacheLookup, CacheError> {
        let name = job.name.clone();
        let policy_owned = policy.clone();
        let workspace = env.workspace().to_path_buf();
        let key = tokio::task::spawn_blocking(move || {
            CacheKey::from_lock_state(&name, &policy_owned, &workspace)
        })
        .await??;

        match self.cache.get(&key).await? {
            Some(entry) => {
                let workspace = env.workspace().to_path_buf();
                let snapshot = entry.snapshot.clone();
                tokio::task::spawn_blocking(move || snapshot.restore(&workspace)).await??;
                self.trace.info(&format!(
                    "[{}] Cache hit for key {} ({} bytes, stored {})",
                    job.name,
                    key,
                    entry.snapshot.len(),
                    entry.created_at.to_rfc3339()
                ));
                Ok(CacheLookup {
                    status: CacheStatus::Hit,
                    key: Some(key),
                })
            }
            None => {
                self.trace
                    .info(&format!("[{}] Cache miss for key {}", job.name, key));
                Ok(CacheLookup {
                    status: CacheStatus::Miss,
                    key: Some(key),
                })
            }
        }
    }

    /// Snapshot the policy paths and store them. Failures never change the
    /// job outcome.
    async fn save_cache(
        &self,
        job: &Job,
        key: &CacheKey,
        policy: &CachePolicy,
        env: &Environment,
    ) {
        let workspace = env.workspace().to_path_buf();
        let paths = policy.paths.clone();
        let capture = tokio::task::spawn_blocking(move || Snapshot::capture(&workspace, &paths));
        let snapshot = match capture
            .await
            .map_err(CacheError::from)
            .and_then(|r| r)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.trace
                    .warning(&format!("[{}] Failed to capture cache snapshot: {}", job.name, e));
                return;
            }
        };

        let size = snapshot.len();
        match self.cache.put(key, snapshot).await {
            Ok(()) => self.trace.info(&format!(
                "[{}] Saved cache {} ({} bytes) to {} store",
                job.name,
                key,
                size,
                self.cache.name()
            )),
            Err(e) => self
                .trace
                .warning(&format!("[{}] Failed to save cache {}: {}", job.name, key, e)),
        }
    }

    fn open_log(&self, job: &Job, context: &JobRunContext) -> Option<JobLogWriter> {
        let diag = self.config.diag_dir.as_ref()?;
        let folder = diag.join(context.run_id.as_simple().to_string());
        match JobLogWriter::new(&folder, &job.name) {
            Ok(log) => Some(log),
            Err(e) => {
                self.trace
                    .warning(&format!("[{}] Job log disabled: {:#}", job.name, e));
                None
            }
        }
    }

    async fn teardown(&self, env: Environment) {
        if self.config.keep_workspaces {
            self.trace.verbose(&format!(
                "[{}] Keeping job directory '{}'",
                env.job_name(),
                env.root().display()
            ));
            return;
        }
        let name = env.job_name().to_string();
        match tokio::task::spawn_blocking(move || env.teardown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self
                .trace
                .warning(&format!("[{}] {}", name, e)),
            Err(e) => self
                .trace
                .warning(&format!("[{}] Teardown task failed: {}", name, e)),
        }
    }
}
