// Repository events delivered by the hosting platform.

use crate::error::{ConfigurationError, EventPayloadError};
use crate::workflow::pattern::normalize_branch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The event kinds cinder reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "push" => Ok(EventKind::Push),
            "pull_request" => Ok(EventKind::PullRequest),
            other => Err(ConfigurationError::UnsupportedEvent(other.to_string())),
        }
    }
}

/// An incoming repository event.
///
/// `branch` is the pushed branch for `push` and the target (base) branch for
/// `pull_request`. `source_branch` is the PR head; matching never looks at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, branch: &str, source_branch: Option<&str>) -> Self {
        Self {
            kind,
            branch: normalize_branch(branch).to_string(),
            source_branch: source_branch.map(|b| normalize_branch(b).to_string()),
        }
    }

    pub fn push(branch: &str) -> Self {
        Self::new(EventKind::Push, branch, None)
    }

    pub fn pull_request(target: &str, source: &str) -> Self {
        Self::new(EventKind::PullRequest, target, Some(source))
    }

    /// Build an event from a webhook payload as delivered by the hosting platform.
    ///
    /// Push payloads carry the branch in `ref`; pull request payloads carry
    /// `pull_request.base.ref` and `pull_request.head.ref`.
    pub fn from_payload(kind: EventKind, payload: &str) -> Result<Self, EventPayloadError> {
        let json: serde_json::Value = serde_json::from_str(payload)?;
        match kind {
            EventKind::Push => {
                let branch = json
                    .get("ref")
                    .and_then(|v| v.as_str())
                    .ok_or(EventPayloadError::MissingField("ref"))?;
                Ok(Self::push(branch))
            }
            EventKind::PullRequest => {
                let pr = json
                    .get("pull_request")
                    .ok_or(EventPayloadError::MissingField("pull_request"))?;
                let base = pr
                    .pointer("/base/ref")
                    .and_then(|v| v.as_str())
                    .ok_or(EventPayloadError::MissingField("pull_request.base.ref"))?;
                let head = pr.pointer("/head/ref").and_then(|v| v.as_str());
                Ok(Self::new(EventKind::PullRequest, base, head))
            }
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.source_branch) {
            (EventKind::PullRequest, Some(source)) => {
                write!(f, "pull_request {} -> {}", source, self.branch)
            }
            _ => write!(f, "{} {}", self.kind, self.branch),
        }
    }
}
