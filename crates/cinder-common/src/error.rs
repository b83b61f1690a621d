// Error taxonomy for everything that can go wrong before a job runs.

use std::path::PathBuf;

/// A workflow document or run request that cannot be executed.
///
/// Raised at load time or when a run is requested; no job runs once one is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to read workflow '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed workflow document: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("workflow declares no jobs")]
    NoJobs,

    #[error("job '{0}' is declared more than once")]
    DuplicateJob(String),

    #[error("jobs '{first}' and '{second}' map to the same job directory '{directory}'")]
    JobNameCollision {
        first: String,
        second: String,
        directory: String,
    },

    #[error("job '{0}' has no steps")]
    EmptyJob(String),

    #[error("step {index} of job '{job}' has an empty 'run' command")]
    EmptyStep { job: String, index: usize },

    #[error("unsupported event kind '{0}', expected 'push' or 'pull_request'")]
    UnsupportedEvent(String),

    #[error("invalid branch pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("job '{0}' is not defined in the workflow")]
    UndefinedJob(String),

    #[error("invalid timeout in {context}: {value}")]
    InvalidTimeout { context: String, value: f64 },

    #[error("invalid environment variable '{name}': {reason}")]
    InvalidEnv { name: String, reason: &'static str },

    #[error("working-directory '{path}' of step {index} in job '{job}' must stay inside the workspace")]
    InvalidWorkingDirectory {
        job: String,
        index: usize,
        path: String,
    },

    #[error("invalid cache configuration for job '{job}': {reason}")]
    InvalidCache { job: String, reason: String },
}

/// A hosting-platform event payload that could not be turned into an `Event`.
#[derive(Debug, thiserror::Error)]
pub enum EventPayloadError {
    #[error("event payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event payload has no '{0}' field")]
    MissingField(&'static str),
}
