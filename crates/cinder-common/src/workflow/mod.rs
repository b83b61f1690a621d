pub mod document;
pub mod models;
pub mod parser;
pub mod pattern;

pub use models::{CachePolicy, Job, ShellKind, Step, TriggerRule, WorkflowDefinition};
pub use parser::WorkflowParser;
pub use pattern::BranchPattern;
