// cinder-sdk: Foundation layer for the cinder CI orchestrator.
// This crate has no dependencies on other cinder crates and provides
// process invocation, trace sinks and filesystem helpers used throughout.

pub mod io_util;
pub mod process_invoker;
pub mod trace;

// Re-export commonly used items at crate root
pub use io_util::IOUtil;
pub use process_invoker::{
    OutputLine, OutputStream, ProcessExit, ProcessInvoker, ProcessOutcome, ProcessRequest,
};
pub use trace::{
    CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter,
};
