//! Raw serde shapes of a workflow YAML document.
//!
//! These mirror the file exactly and are turned into the validated types in
//! [`super::models`] by [`super::parser::WorkflowParser`]. Unknown keys are
//! rejected so typos fail the load instead of being silently ignored.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;

/// Top-level workflow document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "on")]
    pub on: TriggerDocument,

    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub jobs: OrderedJobs,
}

/// Trigger configuration.
///
/// Supports multiple trigger formats:
/// - Simple: `on: push`
/// - List: `on: [push, pull_request]`
/// - Detailed: `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TriggerDocument {
    Single(String),
    Multiple(Vec<String>),
    Detailed(BTreeMap<String, Option<EventFilterDocument>>),
}

/// Branch filter for a single event kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventFilterDocument {
    #[serde(default)]
    pub branches: Option<Vec<String>>,
}

/// Jobs in declaration order. Duplicate keys are kept so validation can
/// report them by name.
#[derive(Debug, Clone, Default)]
pub struct OrderedJobs(pub Vec<(String, JobDocument)>);

impl<'de> Deserialize<'de> for OrderedJobs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = OrderedJobs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of job names to job definitions")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut jobs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, job)) = map.next_entry::<String, JobDocument>()? {
                    jobs.push((name, job));
                }
                Ok(OrderedJobs(jobs))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OrderedJobs::default())
            }
        }

        deserializer.deserialize_map(JobsVisitor)
    }
}

/// One entry under `jobs:`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDocument {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "on")]
    pub on: Option<TriggerDocument>,

    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    #[serde(default)]
    pub cache: Option<CacheDocument>,

    #[serde(default)]
    pub steps: Vec<StepDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheDocument {
    #[serde(default)]
    pub toolchain: Option<String>,

    #[serde(default, rename = "key-files")]
    pub key_files: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    #[serde(default)]
    pub name: Option<String>,

    pub run: String,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,
}
