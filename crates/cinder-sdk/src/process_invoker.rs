use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);
/// How long to keep draining stdout/stderr after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which stream an output line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Everything needed to start one child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    /// When set, the child only sees `environment` and nothing inherited.
    pub clear_environment: bool,
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn environment(mut self, environment: HashMap<String, String>, clear: bool) -> Self {
        self.environment = environment;
        self.clear_environment = clear;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own. Death by signal N is reported as 128 + N.
    Exited(i32),
    /// The request timeout elapsed and the process group was killed.
    TimedOut,
    /// The cancellation token fired and the process group was stopped.
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(0))
    }
}

/// Result of a completed `execute` call.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    pub output: Vec<OutputLine>,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    /// The last `count` output lines joined with newlines.
    pub fn output_tail(&self, count: usize) -> String {
        let start = self.output.len().saturating_sub(count);
        self.output[start..]
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Spawns a child process in its own process group, captures stdout/stderr
/// line by line, and enforces a timeout and cooperative cancellation.
///
/// A timeout kills the whole group at once. Cancellation escalates
/// SIGINT, then SIGTERM, then SIGKILL, waiting a grace period between each.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    line_sink: Option<mpsc::UnboundedSender<OutputLine>>,
    sigint_timeout: Duration,
    sigterm_timeout: Duration,
}

impl ProcessInvoker {
    /// Create a new `ProcessInvoker` with the given trace writer.
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            trace,
            line_sink: None,
            sigint_timeout: SIGINT_TIMEOUT,
            sigterm_timeout: SIGTERM_TIMEOUT,
        }
    }

    /// Forward every output line to `sink` as it is read.
    pub fn with_line_sink(mut self, sink: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.line_sink = Some(sink);
        self
    }

    /// Override the grace periods used when escalating a cancellation.
    pub fn with_cancel_grace(mut self, sigint: Duration, sigterm: Duration) -> Self {
        self.sigint_timeout = sigint;
        self.sigterm_timeout = sigterm;
        self
    }

    /// Run the process described by `request` to completion.
    ///
    /// Returns `Err` only when the process could not be started or waited on.
    /// Non-zero exits, timeouts and cancellation are reported through
    /// [`ProcessOutcome::exit`].
    pub async fn execute(
        &self,
        request: &ProcessRequest,
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutcome> {
        anyhow::ensure!(!request.program.is_empty(), "program must not be empty");

        self.trace.verbose("Starting process:");
        self.trace
            .verbose(&format!("  File name: '{}'", request.program));
        self.trace
            .verbose(&format!("  Arguments: '{}'", request.args.join(" ")));

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);

        if let Some(dir) = &request.working_directory {
            anyhow::ensure!(
                dir.is_dir(),
                "Working directory '{}' does not exist",
                dir.display()
            );
            self.trace
                .verbose(&format!("  Working directory: '{}'", dir.display()));
            cmd.current_dir(dir);
        }

        if request.clear_environment {
            cmd.env_clear();
        }
        cmd.envs(&request.environment);

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{}'",
                request.program,
                request.args.join(" ")
            )
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace.verbose(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let output = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, OutputStream::Stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, OutputStream::Stderr, output.clone()));
        }

        let timeout = async {
            match request.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                ProcessExit::Exited(exit_code_of(&status))
            }
            _ = &mut timeout => {
                self.trace.info(&format!(
                    "Process {pid} exceeded its timeout, killing process group."
                ));
                self.kill_process_group(&mut child).await;
                ProcessExit::TimedOut
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                self.cancel_and_kill_process(&mut child).await;
                ProcessExit::Cancelled
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                self.trace
                    .warning("Output stream still open after process exit, abandoning it.");
                reader.abort();
            }
        }

        let elapsed = start.elapsed();
        self.trace.verbose(&format!(
            "Finished process {pid} with {exit:?}, and elapsed time {elapsed:.2?}."
        ));

        let output = std::mem::take(&mut *output.lock());
        Ok(ProcessOutcome {
            exit,
            output,
            elapsed,
        })
    }

    fn spawn_reader<R>(
        &self,
        stream: R,
        kind: OutputStream,
        output: Arc<parking_lot::Mutex<Vec<OutputLine>>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.line_sink.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                // Output is not interpreted; invalid UTF-8 is replaced, never dropped.
                let text = String::from_utf8_lossy(trim_line_ending(&buffer)).into_owned();
                let line = OutputLine { stream: kind, text };
                if let Some(sink) = &sink {
                    let _ = sink.send(line.clone());
                }
                output.lock().push(line);
            }
        })
    }

    /// Graceful cancellation: SIGINT, then SIGTERM, then SIGKILL.
    async fn cancel_and_kill_process(&self, child: &mut Child) {
        if self
            .send_signal_and_wait(child, Signal::Int, self.sigint_timeout)
            .await
        {
            self.trace
                .info("Process cancelled successfully through SIGINT.");
            return;
        }

        if self
            .send_signal_and_wait(child, Signal::Term, self.sigterm_timeout)
            .await
        {
            self.trace
                .info("Process terminated successfully through SIGTERM.");
            return;
        }

        self.trace.info(
            "Kill entire process group since both cancel and terminate signals have been ignored.",
        );
        self.kill_process_group(child).await;
    }

    async fn kill_process_group(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Send a signal to the child's process group and wait up to `timeout`
    /// for the child to exit. Returns `true` if it exited in time.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let pid = match child.id() {
            Some(id) => id,
            None => return true,
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace
            .verbose(&format!("Sending {sig:?} to process group {pid}."));

        if nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process group {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
