// Orchestrator: matches an event against a workflow, fans the selected jobs
// out as concurrent tasks and joins them into a RunVerdict.

use crate::run_registry::{RunKey, RunRegistry, RunTicket};
use crate::trigger_matcher::TriggerMatcher;
use anyhow::Result;
use cinder_common::workflow::WorkflowDefinition;
use cinder_common::{
    CacheBackend, ConfigurationError, Event, HostContext, JobResult, RunVerdict,
    WellKnownDirectory,
};
use cinder_sdk::TraceWriter;
use cinder_worker::{
    CacheStore, FileCacheStore, JobExecutor, JobExecutorConfig, JobRunContext, MemoryCacheStore,
    ScriptStepRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-invocation knobs that are not part of the workflow itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Checkout copied into every job workspace.
    pub source: Option<PathBuf>,
    /// Restrict the run to these jobs. Empty runs everything that matched.
    pub only_jobs: Vec<String>,
}

/// A finished run submitted through the registry.
#[derive(Debug, Clone)]
pub struct SubmittedRun {
    pub verdict: RunVerdict,
    /// A newer event for the same branch cancelled this run.
    pub superseded: bool,
}

pub struct Orchestrator {
    executor: Arc<JobExecutor>,
    registry: RunRegistry,
    shutdown: CancellationToken,
    trace: Arc<dyn TraceWriter>,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<JobExecutor>,
        shutdown: CancellationToken,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            executor,
            registry: RunRegistry::new(),
            shutdown,
            trace,
        }
    }

    /// Wire the production executor from the host's settings and directories.
    pub fn from_host_context(host: &HostContext, backend: CacheBackend) -> Result<Self> {
        let settings = host.settings();
        let work_dir = host.get_directory(WellKnownDirectory::Work);
        cinder_sdk::IOUtil::ensure_directory(&work_dir)?;

        let cache: Arc<dyn CacheStore> = match backend {
            CacheBackend::File => Arc::new(FileCacheStore::new(
                host.get_directory(WellKnownDirectory::Cache),
            )),
            CacheBackend::Memory => Arc::new(MemoryCacheStore::new()),
        };

        let config = JobExecutorConfig {
            work_dir,
            diag_dir: Some(host.get_directory(WellKnownDirectory::Diag)),
            default_step_timeout: settings.default_step_timeout(),
            keep_workspaces: settings.keep_workspaces,
        };
        let executor = JobExecutor::new(
            config,
            cache,
            Arc::new(ScriptStepRunner::new(Arc::new(host.get_trace("StepRunner")))),
            Arc::new(host.get_trace("JobExecutor")),
        );

        Ok(Self::new(
            Arc::new(executor),
            host.shutdown_token(),
            Arc::new(host.get_trace("Orchestrator")),
        ))
    }

    /// Run every job of `workflow` that `event` triggers and wait for all of
    /// them. Only a bad `--job` filter is an error; job failures are in the
    /// verdict.
    pub async fn run_workflow(
        &self,
        event: &Event,
        workflow: &WorkflowDefinition,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunVerdict, ConfigurationError> {
        for name in &options.only_jobs {
            if workflow.job(name).is_none() {
                return Err(ConfigurationError::UndefinedJob(name.clone()));
            }
        }

        let run_id = Uuid::new_v4();
        let selected: Vec<_> = TriggerMatcher::select(event, workflow)
            .into_iter()
            .filter(|job| options.only_jobs.is_empty() || options.only_jobs.contains(&job.name))
            .collect();

        if selected.is_empty() {
            self.trace.info(&format!(
                "No job in workflow '{}' is triggered by {}",
                workflow.name, event
            ));
            return Ok(RunVerdict::no_op(run_id, &workflow.name, event.clone()));
        }

        self.trace.info(&format!(
            "Run {} of workflow '{}' for {}: {} job(s): {}",
            run_id,
            workflow.name,
            event,
            selected.len(),
            selected
                .iter()
                .map(|j| j.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let context = Arc::new(JobRunContext {
            run_id,
            event: event.clone(),
            source: options.source.clone(),
            workflow_env: workflow.env.clone(),
        });

        let (names, handles): (Vec<String>, Vec<_>) = selected
            .into_iter()
            .map(|job| {
                let job = job.clone();
                let name = job.name.clone();
                let executor = self.executor.clone();
                let context = context.clone();
                let cancel = cancel.clone();
                let handle =
                    tokio::spawn(async move { executor.execute(&job, &context, cancel).await });
                (name, handle)
            })
            .unzip();

        let results: Vec<JobResult> = futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| match joined {
                Ok(result) => result,
                Err(e) => {
                    self.trace
                        .error(&format!("Executor for job '{}' crashed: {}", name, e));
                    JobResult::crashed(name, e.to_string())
                }
            })
            .collect();

        let verdict = RunVerdict::from_results(run_id, &workflow.name, event.clone(), results);
        self.trace.info(&format!(
            "Run {} finished: {:?}",
            run_id, verdict.verdict
        ));
        Ok(verdict)
    }

    /// Like [`run_workflow`](Self::run_workflow), but first supersedes any
    /// in-flight run for the same workflow and branch.
    pub async fn submit(
        &self,
        event: &Event,
        workflow: &WorkflowDefinition,
        options: &RunOptions,
    ) -> Result<SubmittedRun, ConfigurationError> {
        let ticket = self.begin(event, workflow);
        self.run_with_ticket(ticket, event, workflow, options).await
    }

    /// Register `event` in the run registry, cancelling the in-flight run it
    /// supersedes. Supersession follows the order of `begin` calls, so callers
    /// take the ticket in arrival order before spawning the run.
    pub fn begin(&self, event: &Event, workflow: &WorkflowDefinition) -> RunTicket {
        self.registry
            .begin(RunKey::new(&workflow.name, event), &self.shutdown)
    }

    /// Run a workflow under a ticket from [`begin`](Self::begin).
    pub async fn run_with_ticket(
        &self,
        ticket: RunTicket,
        event: &Event,
        workflow: &WorkflowDefinition,
        options: &RunOptions,
    ) -> Result<SubmittedRun, ConfigurationError> {
        let verdict = self
            .run_workflow(event, workflow, options, ticket.token())
            .await;
        self.registry.finish(&ticket);

        Ok(SubmittedRun {
            verdict: verdict?,
            superseded: ticket.is_superseded(),
        })
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_common::workflow::{CachePolicy, Job, ShellKind, Step};
    use cinder_common::{JobOutcome, VerdictKind, WorkflowParser};
    use cinder_sdk::NullTraceWriter;
    use std::fs;
    use std::time::Duration;

    struct Fixture {
        _root: tempfile::TempDir,
        source: PathBuf,
        cache: Arc<MemoryCacheStore>,
        orchestrator: Orchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let source = root.path().join("checkout");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("Cargo.lock"), "[[package]]\nname = \"serde\"\n").unwrap();

            let cache = Arc::new(MemoryCacheStore::new());
            let trace: Arc<dyn TraceWriter> = Arc::new(NullTraceWriter);
            let executor = JobExecutor::new(
                JobExecutorConfig {
                    work_dir: root.path().join("work"),
                    diag_dir: Some(root.path().join("diag")),
                    default_step_timeout: Duration::from_secs(60),
                    keep_workspaces: false,
                },
                cache.clone(),
                Arc::new(
                    ScriptStepRunner::new(trace.clone())
                        .with_cancel_grace(Duration::from_millis(200), Duration::from_millis(200)),
                ),
                trace.clone(),
            );
            Self {
                orchestrator: Orchestrator::new(
                    Arc::new(executor),
                    CancellationToken::new(),
                    trace,
                ),
                source,
                cache,
                _root: root,
            }
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                source: Some(self.source.clone()),
                only_jobs: Vec::new(),
            }
        }
    }

    fn sh(name: &str, run: &str) -> Step {
        Step::new(name, run).with_shell(ShellKind::Sh)
    }

    fn four_jobs(fmt_script: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "CI".to_string(),
            env: Default::default(),
            jobs: vec![
                Job::new("check", vec![sh("check", "test -f Cargo.lock")]),
                Job::new("fmt", vec![sh("fmt", fmt_script)]),
                Job::new("docs", vec![sh("docs", "mkdir -p target/doc")]),
                Job::new("tests", vec![sh("build", "true"), sh("run", "true")]),
            ],
        }
    }

    #[tokio::test]
    async fn one_failing_job_fails_the_run_and_others_still_report() {
        let fixture = Fixture::new();
        let workflow = four_jobs("echo 'Diff in src/lib.rs'\nexit 1");

        let verdict = fixture
            .orchestrator
            .run_workflow(
                &Event::push("master"),
                &workflow,
                &fixture.options(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            verdict.verdict,
            VerdictKind::Failure {
                failing_jobs: vec!["fmt".to_string()]
            }
        );
        assert_ne!(verdict.exit_code(), 0);
        assert_eq!(verdict.results.len(), 4);
        let outcomes: Vec<_> = verdict
            .results
            .iter()
            .map(|r| (r.job_name.as_str(), r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("check", JobOutcome::Success),
                ("fmt", JobOutcome::Failure),
                ("docs", JobOutcome::Success),
                ("tests", JobOutcome::Success),
            ]
        );
        let fmt = verdict.failing_jobs().next().unwrap();
        assert_eq!(fmt.failure.as_ref().unwrap().output_tail, "Diff in src/lib.rs");
    }

    #[tokio::test]
    async fn pull_request_to_uncovered_branch_is_a_no_op() {
        let fixture = Fixture::new();
        let workflow = WorkflowParser::parse(include_str!("../../../demos/ci.yml")).unwrap();

        let verdict = fixture
            .orchestrator
            .run_workflow(
                &Event::pull_request("develop", "feature/login"),
                &workflow,
                &fixture.options(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(verdict.is_no_op());
        assert!(verdict.results.is_empty());
        assert_eq!(verdict.exit_code(), 0);
    }

    #[tokio::test]
    async fn undefined_job_filter_is_configuration_error() {
        let fixture = Fixture::new();
        let options = RunOptions {
            only_jobs: vec!["lint".to_string()],
            ..fixture.options()
        };

        let err = fixture
            .orchestrator
            .run_workflow(
                &Event::push("master"),
                &four_jobs("true"),
                &options,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UndefinedJob(name) if name == "lint"));
    }

    #[tokio::test]
    async fn job_filter_limits_selection() {
        let fixture = Fixture::new();
        let options = RunOptions {
            only_jobs: vec!["fmt".to_string()],
            ..fixture.options()
        };

        let verdict = fixture
            .orchestrator
            .run_workflow(
                &Event::push("master"),
                &four_jobs("true"),
                &options,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.verdict, VerdictKind::Success);
        assert_eq!(verdict.results.len(), 1);
    }

    #[tokio::test]
    async fn second_run_with_same_lock_state_hits_cache() {
        let fixture = Fixture::new();
        let job = Job::new(
            "build",
            vec![sh("compile", "mkdir -p target && date > target/stamp")],
        )
        .with_cache(CachePolicy::new("stable", &["Cargo.lock"], &["target"]));
        let workflow = WorkflowDefinition {
            name: "CI".to_string(),
            env: Default::default(),
            jobs: vec![job],
        };
        let event = Event::push("master");

        let first = fixture
            .orchestrator
            .run_workflow(&event, &workflow, &fixture.options(), CancellationToken::new())
            .await
            .unwrap();
        let second = fixture
            .orchestrator
            .run_workflow(&event, &workflow, &fixture.options(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.results[0].cache, cinder_common::CacheStatus::Miss);
        assert_eq!(second.results[0].cache, cinder_common::CacheStatus::Hit);
        assert_eq!(fixture.cache.len(), 1);

        fs::write(fixture.source.join("Cargo.lock"), "changed").unwrap();
        let third = fixture
            .orchestrator
            .run_workflow(&event, &workflow, &fixture.options(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(third.results[0].cache, cinder_common::CacheStatus::Miss);
        assert_eq!(fixture.cache.len(), 2);
    }

    #[tokio::test]
    async fn newer_push_supersedes_running_run() {
        let fixture = Arc::new(Fixture::new());
        let slow = WorkflowDefinition {
            name: "CI".to_string(),
            env: Default::default(),
            jobs: vec![Job::new("slow", vec![sh("wait", "sleep 30")])
                .with_cache(CachePolicy::new("stable", &["Cargo.lock"], &["target"]))],
        };

        let first = {
            let fixture = fixture.clone();
            let slow = slow.clone();
            tokio::spawn(async move {
                fixture
                    .orchestrator
                    .submit(&Event::push("master"), &slow, &fixture.options())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        let quick = four_jobs("true");
        let second = fixture
            .orchestrator
            .submit(&Event::push("master"), &quick, &fixture.options())
            .await
            .unwrap();
        assert_eq!(second.verdict.verdict, VerdictKind::Success);
        assert!(!second.superseded);

        let first = first.await.unwrap().unwrap();
        assert!(first.superseded);
        assert_eq!(
            first.verdict.verdict,
            VerdictKind::Cancelled {
                aborted_jobs: vec!["slow".to_string()]
            }
        );
        assert_eq!(first.verdict.results[0].aborted_step.as_deref(), Some("wait"));
        assert!(fixture.cache.is_empty());
        assert_eq!(fixture.orchestrator.registry().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tickets_taken_in_arrival_order_supersede_older_runs() {
        let fixture = Arc::new(Fixture::new());
        let slow = WorkflowDefinition {
            name: "CI".to_string(),
            env: Default::default(),
            jobs: vec![Job::new("slow", vec![sh("wait", "sleep 30")])],
        };
        let quick = WorkflowDefinition {
            name: "CI".to_string(),
            env: Default::default(),
            jobs: vec![Job::new("quick", vec![sh("ok", "true")])],
        };

        for _ in 0..10 {
            let older = fixture.orchestrator.begin(&Event::push("master"), &slow);
            let newer = fixture.orchestrator.begin(&Event::push("master"), &quick);

            let spawn = |ticket: RunTicket, workflow: WorkflowDefinition| {
                let fixture = fixture.clone();
                tokio::spawn(async move {
                    fixture
                        .orchestrator
                        .run_with_ticket(
                            ticket,
                            &Event::push("master"),
                            &workflow,
                            &fixture.options(),
                        )
                        .await
                })
            };
            let older = spawn(older, slow.clone());
            let newer = spawn(newer, quick.clone());

            let newer = newer.await.unwrap().unwrap();
            assert!(!newer.superseded);
            assert_eq!(newer.verdict.verdict, VerdictKind::Success);

            let older = older.await.unwrap().unwrap();
            assert!(older.superseded);
            assert!(matches!(older.verdict.verdict, VerdictKind::Cancelled { .. }));
        }
        assert_eq!(fixture.orchestrator.registry().in_flight(), 0);
    }

    /// Panics on every step, standing in for a bug in the executor.
    struct PanickingRunner;

    #[async_trait::async_trait]
    impl cinder_worker::StepRunner for PanickingRunner {
        async fn run(
            &self,
            _step: &Step,
            _env: &mut cinder_worker::Environment,
            _timeout: Duration,
            _cancel: CancellationToken,
            _output: Option<tokio::sync::mpsc::UnboundedSender<cinder_sdk::OutputLine>>,
        ) -> cinder_worker::StepOutcome {
            panic!("step runner exploded");
        }
    }

    #[tokio::test]
    async fn crashed_executor_still_yields_one_failed_result() {
        let root = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(
            JobExecutorConfig {
                work_dir: root.path().join("work"),
                diag_dir: None,
                default_step_timeout: Duration::from_secs(60),
                keep_workspaces: false,
            },
            Arc::new(MemoryCacheStore::new()),
            Arc::new(PanickingRunner),
            Arc::new(NullTraceWriter),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(executor),
            CancellationToken::new(),
            Arc::new(NullTraceWriter),
        );

        let verdict = orchestrator
            .run_workflow(
                &Event::push("master"),
                &four_jobs("true"),
                &RunOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(verdict.results.len(), 4);
        assert_eq!(verdict.failing_jobs().count(), 4);
        let failure = verdict.results[0].failure.as_ref().unwrap();
        assert!(matches!(
            failure.reason,
            cinder_common::FailureReason::Panicked { .. }
        ));
    }
}
