// cinder-orchestrator: Selects the jobs an event triggers, runs them
// concurrently and folds their results into one verdict.

pub mod orchestrator;
pub mod report;
pub mod run_registry;
pub mod trigger_matcher;

pub use orchestrator::{Orchestrator, RunOptions, SubmittedRun};
pub use run_registry::{RunKey, RunRegistry, RunTicket};
pub use trigger_matcher::TriggerMatcher;
