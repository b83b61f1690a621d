// cinder-common: Shared model and host infrastructure for cinder.
// Depends on `cinder-sdk`; used by the worker and orchestrator crates.

pub mod config_store;
pub mod constants;
pub mod error;
pub mod event;
pub mod host_context;
pub mod job_log;
pub mod job_result;
pub mod tracing;
pub mod verdict;
pub mod workflow;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{CacheBackend, ConfigurationStore, OrchestratorSettings};
pub use constants::WellKnownDirectory;
pub use error::{ConfigurationError, EventPayloadError};
pub use event::{Event, EventKind};
pub use host_context::HostContext;
pub use job_log::JobLogWriter;
pub use job_result::{CacheStatus, FailureReason, JobOutcome, JobResult, StepFailure};
pub use tracing::{TraceEventType, TraceManager, Tracing};
pub use verdict::{RunVerdict, VerdictKind};
pub use workflow::{
    BranchPattern, CachePolicy, Job, ShellKind, Step, TriggerRule, WorkflowDefinition,
    WorkflowParser,
};
