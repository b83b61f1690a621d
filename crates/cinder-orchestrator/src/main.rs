// Entry point for the `cinder` binary.
//
// `run` evaluates one event, `validate` only checks a workflow file, and
// `listen` consumes newline-delimited JSON events from stdin, superseding
// in-flight runs for the same branch.

use anyhow::{Context, Result};
use cinder_common::constants::return_code;
use cinder_common::{
    CacheBackend, Event, EventKind, HostContext, WorkflowDefinition, WorkflowParser,
};
use cinder_orchestrator::{report, Orchestrator, RunOptions, SubmittedRun};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(name = "cinder", version, about = "Event-driven CI orchestrator")]
struct Cli {
    /// Root directory for settings, work, cache and logs (default: $CINDER_ROOT or ./.cinder-root)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the jobs a single event triggers
    Run(RunArgs),

    /// Parse and validate a workflow file without running anything
    Validate {
        #[arg(long)]
        workflow: PathBuf,
    },

    /// Read events as JSON lines from stdin and run each one
    Listen {
        #[arg(long)]
        workflow: PathBuf,

        /// Checkout copied into every job workspace
        #[arg(long)]
        source: Option<PathBuf>,

        #[arg(long)]
        cache: Option<CacheBackend>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    workflow: PathBuf,

    /// `push` or `pull_request`
    #[arg(long)]
    event: EventKind,

    /// Pushed branch, or the pull request's target branch
    #[arg(long, required_unless_present = "event_path")]
    branch: Option<String>,

    /// Pull request head branch
    #[arg(long)]
    source_branch: Option<String>,

    /// Webhook payload to read the branches from
    #[arg(long)]
    event_path: Option<PathBuf>,

    /// Checkout copied into every job workspace
    #[arg(long)]
    source: Option<PathBuf>,

    /// Only run these jobs (repeatable)
    #[arg(long = "job")]
    jobs: Vec<String>,

    /// Also write the verdict as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long)]
    cache: Option<CacheBackend>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build Tokio runtime: {}", e);
            std::process::exit(return_code::CONFIGURATION_ERROR);
        }
    };

    let exit_code = runtime.block_on(async move { run(cli).await });
    std::process::exit(exit_code);
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> i32 {
    let root = HostContext::resolve_root(cli.root.as_deref());

    match cli.command {
        Command::Validate { workflow } => validate(&workflow),
        Command::Run(args) => match run_once(&root, args).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                return_code::CONFIGURATION_ERROR
            }
        },
        Command::Listen {
            workflow,
            source,
            cache,
        } => match listen(&root, &workflow, source, cache).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                return_code::CONFIGURATION_ERROR
            }
        },
    }
}

fn validate(path: &Path) -> i32 {
    match WorkflowParser::from_file(path) {
        Ok(workflow) => {
            println!(
                "Workflow '{}' is valid: {} job(s) ({})",
                workflow.name,
                workflow.jobs.len(),
                workflow.job_names().collect::<Vec<_>>().join(", ")
            );
            return_code::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid workflow '{}': {}", path.display(), e);
            return_code::CONFIGURATION_ERROR
        }
    }
}

/// Host context, workflow and orchestrator for a run or listen session.
/// Ctrl-C or SIGTERM cancels every in-flight run.
fn start(
    root: &Path,
    workflow: &Path,
    cache: Option<CacheBackend>,
) -> Result<(Arc<HostContext>, WorkflowDefinition, Orchestrator)> {
    let workflow = WorkflowParser::from_file(workflow)?;
    let host = HostContext::load(root)
        .with_context(|| format!("Failed to load settings from '{}'", root.display()))?;
    let backend = cache.unwrap_or(host.settings().cache_backend);
    tracing::info!(
        root = %root.display(),
        workflow = %workflow.name,
        cache = %backend,
        "cinder starting"
    );
    let orchestrator = Orchestrator::from_host_context(&host, backend)?;

    let signal_host = host.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_host.shutdown("Ctrl-C received");
        }
    });

    #[cfg(unix)]
    {
        let signal_host = host.clone();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    sigterm.recv().await;
                    signal_host.shutdown("SIGTERM received");
                });
            }
            Err(e) => tracing::warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    Ok((host, workflow, orchestrator))
}

async fn run_once(root: &Path, args: RunArgs) -> Result<i32> {
    let event = match &args.event_path {
        Some(path) => {
            let payload = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read event payload '{}'", path.display()))?;
            Event::from_payload(args.event, &payload)
                .with_context(|| format!("Invalid event payload '{}'", path.display()))?
        }
        None => Event::new(
            args.event,
            args.branch.as_deref().unwrap_or_default(),
            args.source_branch.as_deref(),
        ),
    };

    let (host, workflow, orchestrator) = start(root, &args.workflow, args.cache)?;
    let options = RunOptions {
        source: args.source,
        only_jobs: args.jobs,
    };

    let verdict = orchestrator
        .run_workflow(&event, &workflow, &options, host.shutdown_token())
        .await?;

    print!("{}", report::render(&verdict));
    if let Some(path) = &args.report {
        report::write_json(&verdict, path)
            .with_context(|| format!("Failed to write report '{}'", path.display()))?;
    }
    if let Some(reason) = host.shutdown_reason() {
        tracing::warn!("Run interrupted: {}", reason);
    }
    Ok(verdict.exit_code())
}

async fn listen(
    root: &Path,
    workflow: &Path,
    source: Option<PathBuf>,
    cache: Option<CacheBackend>,
) -> Result<i32> {
    let (host, workflow, orchestrator) = start(root, workflow, cache)?;
    let orchestrator = Arc::new(orchestrator);
    let workflow = Arc::new(workflow);
    let options = Arc::new(RunOptions {
        source,
        only_jobs: Vec::new(),
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut runs = JoinSet::new();
    let mut outcome = ListenOutcome::default();
    let shutdown = host.shutdown_token();
    let mut accepting = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if accepting => {
                let Some(line) = line.context("Failed to read events from stdin")? else {
                    accepting = false;
                    continue;
                };
                let Some(event) = parse_event(&line) else { continue };
                tracing::info!("Received {}", event);

                // Take the ticket here so supersession follows arrival order.
                let ticket = orchestrator.begin(&event, &workflow);
                let orchestrator = orchestrator.clone();
                let workflow = workflow.clone();
                let options = options.clone();
                runs.spawn(async move {
                    orchestrator
                        .run_with_ticket(ticket, &event, &workflow, &options)
                        .await
                });
            }
            _ = shutdown.cancelled(), if accepting => accepting = false,
            Some(joined) = runs.join_next() => {
                outcome.record(joined.context("Run task failed")??);
            }
            else => break,
        }
    }

    let ListenOutcome { failed, cancelled } = outcome;
    let exit_code = if failed {
        return_code::RUN_FAILED
    } else if cancelled {
        return_code::RUN_CANCELLED
    } else {
        return_code::SUCCESS
    };
    Ok(exit_code)
}

fn parse_event(line: &str) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Event>(line) {
        Ok(event) => Some(Event::new(
            event.kind,
            &event.branch,
            event.source_branch.as_deref(),
        )),
        Err(e) => {
            tracing::warn!("Ignoring malformed event '{}': {}", line, e);
            None
        }
    }
}

/// Exit status folded over the runs of a `listen` session. Superseded runs
/// do not count.
#[derive(Debug, Default, PartialEq, Eq)]
struct ListenOutcome {
    failed: bool,
    cancelled: bool,
}

impl ListenOutcome {
    /// Report a finished run as soon as it completes.
    fn record(&mut self, submitted: SubmittedRun) {
        print!("{}", report::render(&submitted.verdict));
        if submitted.superseded {
            tracing::info!("Run {} was superseded", submitted.verdict.run_id);
            return;
        }
        match submitted.verdict.exit_code() {
            return_code::RUN_FAILED => self.failed = true,
            return_code::RUN_CANCELLED => self.cancelled = true,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_common::{CacheStatus, JobResult, RunVerdict};
    use std::time::Duration;
    use uuid::Uuid;

    fn submitted(result: JobResult, superseded: bool) -> SubmittedRun {
        SubmittedRun {
            verdict: RunVerdict::from_results(
                Uuid::new_v4(),
                "CI",
                Event::push("master"),
                vec![result],
            ),
            superseded,
        }
    }

    fn aborted(job: &str) -> JobResult {
        JobResult::aborted(job, None, 0, Duration::ZERO, CacheStatus::Disabled)
    }

    #[test]
    fn listen_outcome_ignores_superseded_runs() {
        let mut outcome = ListenOutcome::default();
        outcome.record(submitted(aborted("slow"), true));
        assert_eq!(outcome, ListenOutcome::default());

        outcome.record(submitted(aborted("slow"), false));
        assert!(outcome.cancelled);
        assert!(!outcome.failed);
    }

    #[test]
    fn listen_outcome_records_failures_as_runs_finish() {
        let mut outcome = ListenOutcome::default();
        outcome.record(submitted(JobResult::crashed("fmt", "boom"), false));
        assert!(outcome.failed);
    }

    #[test]
    fn parse_event_skips_blank_and_malformed_lines() {
        assert_eq!(parse_event("   "), None);
        assert_eq!(parse_event("{not json"), None);
        assert_eq!(
            parse_event(r#"{"kind":"push","branch":"refs/heads/master"}"#),
            Some(Event::push("master"))
        );
    }
}
