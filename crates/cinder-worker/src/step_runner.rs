// Runs a single step's script through a shell and reports how it ended.

use crate::environment::Environment;
use crate::file_command_manager::FileCommandManager;
use async_trait::async_trait;
use cinder_common::workflow::{ShellKind, Step};
use cinder_common::FailureReason;
use cinder_sdk::{OutputLine, ProcessExit, ProcessInvoker, ProcessRequest, TraceWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Succeeded,
    Failed { exit_code: i32 },
    TimedOut { after: Duration },
    Cancelled,
    SpawnFailed { message: String },
}

impl StepStatus {
    /// `None` for success and cancellation, which are not failures.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            StepStatus::Succeeded | StepStatus::Cancelled => None,
            StepStatus::Failed { exit_code } => Some(FailureReason::ExitCode { code: *exit_code }),
            StepStatus::TimedOut { after } => Some(FailureReason::TimedOut { after: *after }),
            StepStatus::SpawnFailed { message } => Some(FailureReason::SpawnFailed {
                message: message.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub output: Vec<OutputLine>,
    pub duration: Duration,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// The last `count` output lines joined with newlines.
    pub fn output_tail(&self, count: usize) -> String {
        let start = self.output.len().saturating_sub(count);
        self.output[start..]
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn spawn_failed(message: String, started: Instant) -> Self {
        Self {
            status: StepStatus::SpawnFailed { message },
            output: Vec::new(),
            duration: started.elapsed(),
        }
    }
}

/// Executes one step inside a job environment.
///
/// Implementations must never panic on a bad step; every way a step can go
/// wrong is a [`StepStatus`].
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(
        &self,
        step: &Step,
        env: &mut Environment,
        timeout: Duration,
        cancel: CancellationToken,
        output: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> StepOutcome;
}

/// Interpreter command line for a script, with `{0}` standing for the
/// script path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub extension: &'static str,
}

impl ShellCommand {
    pub fn resolve(shell: &ShellKind) -> Self {
        match shell {
            ShellKind::Default => {
                if which::which("bash").is_ok() {
                    Self::resolve(&ShellKind::Bash)
                } else {
                    Self::resolve(&ShellKind::Sh)
                }
            }
            ShellKind::Bash => Self::new(
                "bash",
                &["--noprofile", "--norc", "-e", "-o", "pipefail", "{0}"],
                "sh",
            ),
            ShellKind::Sh => Self::new("sh", &["-e", "{0}"], "sh"),
            ShellKind::Python => Self::new("python3", &["{0}"], "py"),
            ShellKind::Custom(line) => {
                let mut parts = line.split_whitespace();
                let program = parts.next().unwrap_or("sh").to_string();
                let mut args: Vec<String> = parts.map(str::to_string).collect();
                if !args.iter().any(|a| a.contains("{0}")) {
                    args.push("{0}".to_string());
                }
                let extension = match program.as_str() {
                    "python" | "python3" => "py",
                    _ => "sh",
                };
                Self {
                    program,
                    args,
                    extension,
                }
            }
        }
    }

    fn new(program: &str, args: &[&str], extension: &'static str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            extension,
        }
    }

    /// Arguments with the placeholder replaced by `script`.
    pub fn args_for(&self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy();
        self.args.iter().map(|a| a.replace("{0}", &script)).collect()
    }
}

/// The production runner: writes the script into the job's temp directory,
/// runs it with the job environment, then applies any file commands it left.
pub struct ScriptStepRunner {
    trace: Arc<dyn TraceWriter>,
    cancel_grace: Option<(Duration, Duration)>,
}

impl ScriptStepRunner {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            trace,
            cancel_grace: None,
        }
    }

    /// Shorten the SIGINT and SIGTERM grace periods used on cancellation.
    pub fn with_cancel_grace(mut self, sigint: Duration, sigterm: Duration) -> Self {
        self.cancel_grace = Some((sigint, sigterm));
        self
    }
}

#[async_trait]
impl StepRunner for ScriptStepRunner {
    async fn run(
        &self,
        step: &Step,
        env: &mut Environment,
        timeout: Duration,
        cancel: CancellationToken,
        output: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> StepOutcome {
        let started = Instant::now();
        let shell = ShellCommand::resolve(&step.shell);

        let script_path = env.temp().join(format!(
            "script_{}.{}",
            uuid::Uuid::new_v4().as_simple(),
            shell.extension
        ));
        if let Err(e) = std::fs::write(&script_path, &step.run) {
            return StepOutcome::spawn_failed(
                format!("failed to write script '{}': {}", script_path.display(), e),
                started,
            );
        }

        let commands = match FileCommandManager::initialize(env) {
            Ok(commands) => commands,
            Err(e) => {
                let _ = std::fs::remove_file(&script_path);
                return StepOutcome::spawn_failed(
                    format!("failed to create file command files: {e}"),
                    started,
                );
            }
        };

        let mut vars = env.process_environment(&step.env);
        vars.extend(commands.variables());

        let request = ProcessRequest::new(&shell.program)
            .args(shell.args_for(&script_path))
            .working_directory(env.working_directory(step.working_directory.as_deref()))
            .environment(vars, false)
            .timeout(Some(timeout));

        let mut invoker = ProcessInvoker::new(self.trace.clone());
        if let Some(sink) = output {
            invoker = invoker.with_line_sink(sink);
        }
        if let Some((sigint, sigterm)) = self.cancel_grace {
            invoker = invoker.with_cancel_grace(sigint, sigterm);
        }

        let result = invoker.execute(&request, cancel).await;
        let _ = std::fs::remove_file(&script_path);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = std::fs::remove_file(&commands.env_file);
                let _ = std::fs::remove_file(&commands.path_file);
                return StepOutcome::spawn_failed(format!("{e:#}"), started);
            }
        };

        let status = match outcome.exit {
            ProcessExit::Exited(0) => StepStatus::Succeeded,
            ProcessExit::Exited(code) => StepStatus::Failed { exit_code: code },
            ProcessExit::TimedOut => StepStatus::TimedOut { after: timeout },
            ProcessExit::Cancelled => StepStatus::Cancelled,
        };

        FileCommandManager::process(&commands, env, self.trace.as_ref());

        StepOutcome {
            status,
            output: outcome.output,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_sdk::NullTraceWriter;
    use uuid::Uuid;

    fn runner() -> ScriptStepRunner {
        ScriptStepRunner::new(Arc::new(NullTraceWriter))
    }

    fn environment() -> (tempfile::TempDir, Environment) {
        let work = tempfile::tempdir().unwrap();
        let env = Environment::prepare(work.path(), Uuid::new_v4(), "job", None).unwrap();
        (work, env)
    }

    #[test]
    fn resolves_known_shells() {
        let bash = ShellCommand::resolve(&ShellKind::Bash);
        assert_eq!(bash.program, "bash");
        assert!(bash.args.contains(&"pipefail".to_string()));

        let python = ShellCommand::resolve(&ShellKind::Python);
        assert_eq!(python.program, "python3");
        assert_eq!(python.extension, "py");
    }

    #[test]
    fn custom_shell_appends_script_without_placeholder() {
        let custom = ShellCommand::resolve(&ShellKind::Custom("sh -x".into()));
        assert_eq!(custom.args_for(Path::new("/t/s.sh")), vec!["-x", "/t/s.sh"]);

        let placed = ShellCommand::resolve(&ShellKind::Custom("perl {0} --flag".into()));
        assert_eq!(placed.args_for(Path::new("/t/s.sh")), vec!["/t/s.sh", "--flag"]);
    }

    #[tokio::test]
    async fn successful_step_captures_output() {
        let (_work, mut env) = environment();
        let step = Step::new("greet", "echo hello").with_shell(ShellKind::Sh);

        let outcome = runner()
            .run(&step, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.output_tail(5), "hello");
    }

    #[tokio::test]
    async fn failing_step_reports_exit_code() {
        let (_work, mut env) = environment();
        let step = Step::new("fail", "echo before\nexit 7\necho after").with_shell(ShellKind::Sh);

        let outcome = runner()
            .run(&step, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, StepStatus::Failed { exit_code: 7 });
        assert_eq!(outcome.output_tail(5), "before");
    }

    #[tokio::test]
    async fn timed_out_step() {
        let (_work, mut env) = environment();
        let step = Step::new("slow", "sleep 30").with_shell(ShellKind::Sh);
        let timeout = Duration::from_millis(300);

        let outcome = runner()
            .run(&step, &mut env, timeout, CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, StepStatus::TimedOut { after: timeout });
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_working_directory_is_spawn_failure() {
        let (_work, mut env) = environment();
        let step = Step::new("cd", "true")
            .with_shell(ShellKind::Sh)
            .with_working_directory("does/not/exist");

        let outcome = runner()
            .run(&step, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;

        assert!(matches!(outcome.status, StepStatus::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn step_sees_job_env_and_exports_to_later_steps() {
        let (_work, mut env) = environment();
        env.set_var("GREETING", "hi");
        let first = Step::new(
            "export",
            "echo \"$GREETING\"\n\
             echo \"FROM_FIRST=yes\" >> \"$CINDER_ENV\"\n\
             echo /opt/tools >> \"$CINDER_PATH\"",
        )
        .with_shell(ShellKind::Sh);
        let second =
            Step::new("read", "echo \"$FROM_FIRST\"\necho \"$PATH\"").with_shell(ShellKind::Sh);

        let r = runner();
        let one = r
            .run(&first, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;
        assert_eq!(one.output_tail(1), "hi");
        assert_eq!(env.var("FROM_FIRST"), Some("yes"));

        let two = r
            .run(&second, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;
        assert!(two.succeeded());
        assert_eq!(two.output[0].text, "yes");
        assert!(two.output[1].text.starts_with("/opt/tools"));
    }

    #[tokio::test]
    async fn script_runs_in_workspace_and_is_cleaned_up() {
        let (_work, mut env) = environment();
        let step = Step::new("pwd", "pwd").with_shell(ShellKind::Sh);

        let outcome = runner()
            .run(&step, &mut env, Duration::from_secs(30), CancellationToken::new(), None)
            .await;

        let expected = env.workspace().canonicalize().unwrap();
        assert_eq!(Path::new(&outcome.output[0].text).canonicalize().unwrap(), expected);
        assert_eq!(std::fs::read_dir(env.temp()).unwrap().count(), 0);
    }
}
