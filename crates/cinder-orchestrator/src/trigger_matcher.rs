// Pure selection of the jobs an event triggers.

use cinder_common::workflow::{Job, TriggerRule, WorkflowDefinition};
use cinder_common::Event;

pub struct TriggerMatcher;

impl TriggerMatcher {
    /// A rule matches when the kinds agree and the event branch (the pushed
    /// branch, or the PR target) satisfies one of its patterns. The PR
    /// source branch is never consulted.
    pub fn rule_matches(rule: &TriggerRule, event: &Event) -> bool {
        rule.kind == event.kind && rule.branches.iter().any(|p| p.matches(&event.branch))
    }

    pub fn job_matches(job: &Job, event: &Event) -> bool {
        job.triggers.iter().any(|rule| Self::rule_matches(rule, event))
    }

    /// Jobs triggered by `event`, in declaration order. Empty means no-op.
    pub fn select<'a>(event: &Event, workflow: &'a WorkflowDefinition) -> Vec<&'a Job> {
        workflow
            .jobs
            .iter()
            .filter(|job| Self::job_matches(job, event))
            .collect()
    }
}
