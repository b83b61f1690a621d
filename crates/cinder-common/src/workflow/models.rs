use crate::event::EventKind;
use crate::workflow::pattern::BranchPattern;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A validated workflow: the read-only configuration every run is driven by.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub env: BTreeMap<String, String>,
    /// Jobs in declaration order. Names are unique.
    pub jobs: Vec<Job>,
}

impl WorkflowDefinition {
    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|j| j.name.as_str())
    }
}

/// An independently schedulable unit: trigger rules, cache policy and an
/// ordered step sequence.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub display_name: Option<String>,
    pub triggers: Vec<TriggerRule>,
    pub env: BTreeMap<String, String>,
    /// Default timeout applied to steps that do not set their own.
    pub timeout: Option<Duration>,
    pub cache: Option<CachePolicy>,
    pub steps: Vec<Step>,
}

impl Job {
    /// A job with the given steps that runs on every push and pull request.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            triggers: vec![
                TriggerRule::any_branch(EventKind::Push),
                TriggerRule::any_branch(EventKind::PullRequest),
            ],
            env: BTreeMap::new(),
            timeout: None,
            cache: None,
            steps,
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<TriggerRule>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Name shown in reports.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// One event kind plus the branch patterns it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub kind: EventKind,
    pub branches: Vec<BranchPattern>,
}

impl TriggerRule {
    pub fn new(kind: EventKind, branches: Vec<BranchPattern>) -> Self {
        Self { kind, branches }
    }

    pub fn any_branch(kind: EventKind) -> Self {
        Self::new(kind, vec![BranchPattern::any()])
    }
}

/// What goes into a job's cache key and what its snapshot contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Toolchain identity the key is scoped to, e.g. `stable`.
    pub toolchain: String,
    /// Workspace-relative globs whose file contents form the lock-state fingerprint.
    pub key_files: Vec<String>,
    /// Workspace-relative paths captured into, and restored from, the snapshot.
    pub paths: Vec<PathBuf>,
}

impl CachePolicy {
    pub fn new(toolchain: impl Into<String>, key_files: &[&str], paths: &[&str]) -> Self {
        Self {
            toolchain: toolchain.into(),
            key_files: key_files.iter().map(|s| s.to_string()).collect(),
            paths: paths.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Interpreter a `run` script is handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellKind {
    /// `bash` when it is on PATH, otherwise `sh`.
    Default,
    Bash,
    Sh,
    Python,
    /// A user command line. `{0}` is replaced with the script path, or the
    /// path is appended when no placeholder is present.
    Custom(String),
}

impl ShellKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" => ShellKind::Default,
            "bash" => ShellKind::Bash,
            "sh" => ShellKind::Sh,
            "python" | "python3" => ShellKind::Python,
            other => ShellKind::Custom(other.to_string()),
        }
    }
}

/// The atomic unit of execution and failure.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub run: String,
    pub shell: ShellKind,
    /// Relative to the job workspace.
    pub working_directory: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl Step {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            shell: ShellKind::Default,
            working_directory: None,
            timeout: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Display name for an unnamed step: `Run <first line of the script>`.
    pub fn default_name(run: &str) -> String {
        let first = run.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        format!("Run {first}")
    }
}
