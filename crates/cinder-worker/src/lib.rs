// cinder-worker: Runs one job end to end.
// Prepares an isolated environment, consults the cache, runs the steps with
// fail-fast semantics and populates the cache on success.

pub mod cache;
pub mod environment;
pub mod file_command_manager;
pub mod job_executor;
pub mod step_runner;
pub mod steps_runner;

pub use cache::{
    CacheEntry, CacheError, CacheKey, CacheStore, FileCacheStore, MemoryCacheStore, Snapshot,
};
pub use environment::{Environment, EnvironmentError};
pub use file_command_manager::{FileCommandManager, FileCommands};
pub use job_executor::{JobExecutor, JobExecutorConfig, JobRunContext, JobState};
pub use step_runner::{ScriptStepRunner, ShellCommand, StepOutcome, StepRunner, StepStatus};
pub use steps_runner::{StepsRunner, StepsTermination};
