// Named trace sources handed out by `HostContext::get_trace`.

use cinder_sdk::TraceWriter;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// A per-component trace source.
///
/// Every message goes to the `tracing` subscriber with the component name
/// attached as a structured `component` field, so JSON logs can be filtered
/// by component.
#[derive(Debug, Clone)]
pub struct Tracing {
    name: String,
    level: TraceEventType,
}

impl Tracing {
    pub fn new(name: impl Into<String>, level: TraceEventType) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.level {
            return;
        }

        let component = self.name.as_str();
        match event_type {
            TraceEventType::Error => tracing::error!(component, "{}", message),
            TraceEventType::Warning => tracing::warn!(component, "{}", message),
            TraceEventType::Information => tracing::info!(component, "{}", message),
            TraceEventType::Verbose => tracing::debug!(component, "{}", message),
        }
    }

    /// Get the name of this trace source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log an error and each of its causes.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.error(&err.to_string());
        for cause in err.chain().skip(1) {
            self.error(&format!("  caused by: {cause}"));
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out trace sources that share one minimum level.
#[derive(Debug, Clone)]
pub struct TraceManager {
    level: TraceEventType,
}

impl Default for TraceManager {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
        }
    }
}

impl TraceManager {
    pub fn with_level(level: TraceEventType) -> Self {
        Self { level }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_manager_names_sources() {
        let manager = TraceManager::with_level(TraceEventType::Warning);
        let trace = manager.get("JobExecutor");
        assert_eq!(trace.name(), "JobExecutor");
        // Below-threshold messages are dropped without panicking.
        trace.verbose("ignored");
        trace.warning("kept");
    }

    #[test]
    fn severity_is_ordered() {
        assert!(TraceEventType::Verbose < TraceEventType::Information);
        assert!(TraceEventType::Warning < TraceEventType::Error);
        assert_eq!(TraceEventType::Error.to_string(), "ERR ");
    }
}
