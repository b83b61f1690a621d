// Tracks the in-flight run per (workflow, kind, branch) so that a newer event
// for the same key supersedes the older run.

use cinder_common::{Event, EventKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity of a supersedable run. Pull requests are keyed on
/// `source -> target` so two PRs into the same branch do not cancel each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    workflow: String,
    kind: EventKind,
    branch: String,
}

impl RunKey {
    pub fn new(workflow: &str, event: &Event) -> Self {
        let branch = match (event.kind, &event.source_branch) {
            (EventKind::PullRequest, Some(source)) => format!("{} -> {}", source, event.branch),
            _ => event.branch.clone(),
        };
        Self {
            workflow: workflow.to_string(),
            kind: event.kind,
            branch,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.workflow, self.kind, self.branch)
    }
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

/// Handle for one registered run.
#[derive(Debug, Clone)]
pub struct RunTicket {
    key: RunKey,
    generation: u64,
    token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl RunTicket {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Cancelled on supersession or when the parent token is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a newer run for the same key cancelled this one.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunKey, InFlight>>,
    next_generation: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run for `key`, cancelling whatever run held it.
    pub fn begin(&self, key: RunKey, parent: &CancellationToken) -> RunTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = parent.child_token();
        let superseded = Arc::new(AtomicBool::new(false));

        let previous = self.runs.lock().insert(
            key.clone(),
            InFlight {
                generation,
                token: token.clone(),
                superseded: superseded.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(run = %key, "superseding in-flight run");
            previous.superseded.store(true, Ordering::SeqCst);
            previous.token.cancel();
        }

        RunTicket {
            key,
            generation,
            token,
            superseded,
        }
    }

    /// Drop the registration, unless a newer run has already replaced it.
    pub fn finish(&self, ticket: &RunTicket) {
        let mut runs = self.runs.lock();
        if runs
            .get(&ticket.key)
            .is_some_and(|r| r.generation == ticket.generation)
        {
            runs.remove(&ticket.key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.runs.lock().len()
    }
}
