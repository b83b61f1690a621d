use crate::error::ConfigurationError;
use crate::event::EventKind;
use crate::workflow::document::{
    CacheDocument, JobDocument, StepDocument, TriggerDocument, WorkflowDocument,
};
use crate::workflow::models::{CachePolicy, Job, ShellKind, Step, TriggerRule, WorkflowDefinition};
use crate::workflow::pattern::BranchPattern;

use cinder_sdk::IOUtil;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const DEFAULT_TOOLCHAIN: &str = "default";

/// Loads workflow YAML and turns it into a validated [`WorkflowDefinition`].
///
/// Any problem is a [`ConfigurationError`]; nothing partially valid is returned.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition, ConfigurationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut workflow = Self::parse(&content)?;
        if workflow.name.is_empty() {
            workflow.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
        }
        Ok(workflow)
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse(content: &str) -> Result<WorkflowDefinition, ConfigurationError> {
        let document: WorkflowDocument = serde_yaml::from_str(content)?;
        Self::validate(document)
    }

    /// Validate a raw document for semantic correctness.
    pub fn validate(document: WorkflowDocument) -> Result<WorkflowDefinition, ConfigurationError> {
        if document.jobs.0.is_empty() {
            return Err(ConfigurationError::NoJobs);
        }

        let workflow_triggers = Self::convert_triggers(&document.on)?;
        let env = Self::convert_env(&document.env)?;

        let mut seen = HashSet::new();
        let mut directories: HashMap<String, String> = HashMap::new();
        let mut jobs = Vec::with_capacity(document.jobs.0.len());
        for (name, job) in document.jobs.0 {
            if !seen.insert(name.clone()) {
                return Err(ConfigurationError::DuplicateJob(name));
            }
            // Job directories, logs and cache keys are named after the sanitized name.
            let directory = IOUtil::sanitize_file_name(&name);
            if let Some(first) = directories.get(&directory) {
                return Err(ConfigurationError::JobNameCollision {
                    first: first.clone(),
                    second: name,
                    directory,
                });
            }
            directories.insert(directory, name.clone());
            jobs.push(Self::convert_job(name, job, &workflow_triggers)?);
        }

        Ok(WorkflowDefinition {
            name: document.name.unwrap_or_default(),
            env,
            jobs,
        })
    }

    fn convert_job(
        name: String,
        job: JobDocument,
        workflow_triggers: &[TriggerRule],
    ) -> Result<Job, ConfigurationError> {
        if job.steps.is_empty() {
            return Err(ConfigurationError::EmptyJob(name));
        }

        let triggers = match &job.on {
            Some(on) => Self::convert_triggers(on)?,
            None => workflow_triggers.to_vec(),
        };

        let timeout = job
            .timeout_minutes
            .map(|m| Self::convert_timeout(m, || format!("job '{name}'")))
            .transpose()?;

        let cache = job
            .cache
            .as_ref()
            .map(|c| Self::convert_cache(&name, c))
            .transpose()?;

        let steps = job
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| Self::convert_step(&name, index + 1, step))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Job {
            env: Self::convert_env(&job.env)?,
            display_name: job.name,
            name,
            triggers,
            timeout,
            cache,
            steps,
        })
    }

    fn convert_step(
        job: &str,
        index: usize,
        step: StepDocument,
    ) -> Result<Step, ConfigurationError> {
        if step.run.trim().is_empty() {
            return Err(ConfigurationError::EmptyStep {
                job: job.to_string(),
                index,
            });
        }

        let timeout = step
            .timeout_minutes
            .map(|m| Self::convert_timeout(m, || format!("step {index} of job '{job}'")))
            .transpose()?;

        let working_directory = match step.working_directory.as_deref() {
            Some(dir) => Some(Self::relative_path(dir).ok_or_else(|| {
                ConfigurationError::InvalidWorkingDirectory {
                    job: job.to_string(),
                    index,
                    path: dir.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Step {
            name: step
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| Step::default_name(&step.run)),
            shell: step
                .shell
                .as_deref()
                .map(ShellKind::parse)
                .unwrap_or(ShellKind::Default),
            env: Self::convert_env(&step.env)?,
            run: step.run,
            working_directory,
            timeout,
        })
    }

    fn convert_triggers(on: &TriggerDocument) -> Result<Vec<TriggerRule>, ConfigurationError> {
        let mut rules: Vec<TriggerRule> = Vec::new();
        let mut add = |kind: &str,
                       branches: Option<&Vec<String>>|
         -> Result<(), ConfigurationError> {
            let kind: EventKind = kind.parse()?;
            let branches = match branches {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|b| BranchPattern::parse(b))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => vec![BranchPattern::any()],
            };
            match rules.iter_mut().find(|r| r.kind == kind) {
                Some(existing) => existing.branches.extend(branches),
                None => rules.push(TriggerRule::new(kind, branches)),
            }
            Ok(())
        };

        match on {
            TriggerDocument::Single(kind) => add(kind, None)?,
            TriggerDocument::Multiple(kinds) => {
                for kind in kinds {
                    add(kind, None)?;
                }
            }
            TriggerDocument::Detailed(map) => {
                for (kind, filter) in map {
                    add(kind, filter.as_ref().and_then(|f| f.branches.as_ref()))?;
                }
            }
        }

        Ok(rules)
    }

    fn convert_cache(job: &str, cache: &CacheDocument) -> Result<CachePolicy, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidCache {
            job: job.to_string(),
            reason,
        };

        if cache.key_files.is_empty() {
            return Err(invalid("'key-files' must list at least one file or glob".into()));
        }
        if cache.paths.is_empty() {
            return Err(invalid("'paths' must list at least one path".into()));
        }
        for key_file in &cache.key_files {
            if Self::relative_path(key_file).is_none() {
                return Err(invalid(format!(
                    "key file '{key_file}' must be relative to the workspace"
                )));
            }
        }
        let paths = cache
            .paths
            .iter()
            .map(|p| {
                Self::relative_path(p)
                    .ok_or_else(|| invalid(format!("path '{p}' must be relative to the workspace")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CachePolicy {
            toolchain: cache
                .toolchain
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TOOLCHAIN)
                .to_string(),
            key_files: cache.key_files.clone(),
            paths,
        })
    }

    fn convert_timeout(
        minutes: f64,
        context: impl FnOnce() -> String,
    ) -> Result<Duration, ConfigurationError> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(ConfigurationError::InvalidTimeout {
                context: context(),
                value: minutes,
            });
        }
        Ok(Duration::from_secs_f64(minutes * 60.0))
    }

    fn convert_env(
        raw: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<BTreeMap<String, String>, ConfigurationError> {
        let mut env = BTreeMap::new();
        for (name, value) in raw {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(ConfigurationError::InvalidEnv {
                    name: name.clone(),
                    reason: "names must be non-empty and contain no '=' or NUL",
                });
            }
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => {
                    return Err(ConfigurationError::InvalidEnv {
                        name: name.clone(),
                        reason: "values must be scalars",
                    })
                }
            };
            env.insert(name.clone(), value);
        }
        Ok(env)
    }

    /// A path that is relative and never climbs out of its base.
    fn relative_path(raw: &str) -> Option<PathBuf> {
        let path = PathBuf::from(raw.trim());
        if path.as_os_str().is_empty() {
            return None;
        }
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        (!escapes).then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CI_WORKFLOW: &str = include_str!("../../../../demos/ci.yml");

    #[test]
    fn parse_bundled_ci_workflow() {
        let workflow = WorkflowParser::parse(CI_WORKFLOW).unwrap();
        assert_eq!(workflow.name, "CI");
        assert_eq!(
            workflow.job_names().collect::<Vec<_>>(),
            vec!["check", "fmt", "docs", "tests"]
        );
        assert_eq!(workflow.env["RUST_BACKTRACE"], "1");

        let check = workflow.job("check").unwrap();
        assert_eq!(check.label(), "Check");
        assert_eq!(check.steps.len(), 2);
        let cache = check.cache.as_ref().unwrap();
        assert_eq!(cache.toolchain, "stable");
        assert_eq!(cache.paths, vec![PathBuf::from("target")]);

        let push = check
            .triggers
            .iter()
            .find(|r| r.kind == EventKind::Push)
            .unwrap();
        assert_eq!(
            push.branches,
            vec![
                BranchPattern::Exact("master".into()),
                BranchPattern::Prefix("release".into())
            ]
        );

        let fmt = workflow.job("fmt").unwrap();
        assert_eq!(fmt.timeout, Some(Duration::from_secs(300)));
        assert_eq!(fmt.steps[0].name, "Run cargo fmt --all -- --check");
        assert!(fmt.cache.is_none());

        let tests = workflow.job("tests").unwrap();
        assert_eq!(tests.steps[1].timeout, Some(Duration::from_secs(1200)));
        assert_eq!(tests.steps[1].env["RUST_TEST_THREADS"], "4");
    }

    #[test]
    fn job_trigger_overrides_workflow_trigger() {
        let yaml = r#"
on: [push, pull_request]
jobs:
  nightly:
    on:
      push:
        branches: [main]
    steps:
      - run: echo nightly
  always:
    steps:
      - run: echo always
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let nightly = workflow.job("nightly").unwrap();
        assert_eq!(
            nightly.triggers,
            vec![TriggerRule::new(
                EventKind::Push,
                vec![BranchPattern::Exact("main".into())]
            )]
        );
        let always = workflow.job("always").unwrap();
        assert_eq!(
            always.triggers,
            vec![
                TriggerRule::any_branch(EventKind::Push),
                TriggerRule::any_branch(EventKind::PullRequest)
            ]
        );
    }

    #[test]
    fn fractional_timeout_minutes() {
        let yaml = r#"
on: push
jobs:
  quick:
    steps:
      - run: "true"
        timeout-minutes: 0.5
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        assert_eq!(
            workflow.jobs[0].steps[0].timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn rejects_missing_or_empty_jobs() {
        assert!(matches!(
            WorkflowParser::parse("on: push\n"),
            Err(ConfigurationError::NoJobs)
        ));
        assert!(matches!(
            WorkflowParser::parse("on: push\njobs: {}\n"),
            Err(ConfigurationError::NoJobs)
        ));
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let yaml = r#"
on: push
jobs:
  build:
    steps: [ { run: "true" } ]
  build:
    steps: [ { run: "false" } ]
"#;
        assert!(matches!(
            WorkflowParser::parse(yaml),
            Err(ConfigurationError::DuplicateJob(name)) if name == "build"
        ));
    }

    #[test]
    fn rejects_job_names_sharing_a_directory() {
        let yaml = r#"
on: push
jobs:
  "a b":
    steps: [ { run: "true" } ]
  a_b:
    steps: [ { run: "true" } ]
"#;
        match WorkflowParser::parse(yaml) {
            Err(ConfigurationError::JobNameCollision {
                first,
                second,
                directory,
            }) => {
                assert_eq!(first, "a b");
                assert_eq!(second, "a_b");
                assert_eq!(directory, "a_b");
            }
            other => panic!("expected a job name collision, got {other:?}"),
        }
    }

    #[test]
    fn rejects_job_without_steps_and_empty_run() {
        let no_steps = "on: push\njobs:\n  build:\n    steps: []\n";
        assert!(matches!(
            WorkflowParser::parse(no_steps),
            Err(ConfigurationError::EmptyJob(name)) if name == "build"
        ));

        let empty_run = "on: push\njobs:\n  build:\n    steps:\n      - run: \"  \"\n";
        assert!(matches!(
            WorkflowParser::parse(empty_run),
            Err(ConfigurationError::EmptyStep { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_unsupported_event_and_bad_pattern() {
        assert!(matches!(
            WorkflowParser::parse("on: schedule\njobs:\n  a:\n    steps: [ { run: x } ]\n"),
            Err(ConfigurationError::UnsupportedEvent(_))
        ));
        let bad_pattern = r#"
on:
  push:
    branches: ["feature/**"]
jobs:
  a:
    steps: [ { run: x } ]
"#;
        assert!(matches!(
            WorkflowParser::parse(bad_pattern),
            Err(ConfigurationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn rejects_unknown_keys_and_malformed_yaml() {
        let unknown = "on: push\njobs:\n  a:\n    runs-on: ubuntu\n    steps: [ { run: x } ]\n";
        assert!(matches!(
            WorkflowParser::parse(unknown),
            Err(ConfigurationError::Malformed(_))
        ));
        assert!(matches!(
            WorkflowParser::parse("jobs: [unterminated"),
            Err(ConfigurationError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_invalid_timeouts_env_and_cache() {
        let zero_timeout = "on: push\njobs:\n  a:\n    timeout-minutes: 0\n    steps: [ { run: x } ]\n";
        assert!(matches!(
            WorkflowParser::parse(zero_timeout),
            Err(ConfigurationError::InvalidTimeout { .. })
        ));

        let nested_env = "on: push\nenv:\n  A: [1, 2]\njobs:\n  a:\n    steps: [ { run: x } ]\n";
        assert!(matches!(
            WorkflowParser::parse(nested_env),
            Err(ConfigurationError::InvalidEnv { .. })
        ));

        let escaping_cache = r#"
on: push
jobs:
  a:
    cache: { key-files: [Cargo.lock], paths: ["../outside"] }
    steps: [ { run: x } ]
"#;
        assert!(matches!(
            WorkflowParser::parse(escaping_cache),
            Err(ConfigurationError::InvalidCache { .. })
        ));

        let no_key_files = "on: push\njobs:\n  a:\n    cache: { paths: [target] }\n    steps: [ { run: x } ]\n";
        assert!(matches!(
            WorkflowParser::parse(no_key_files),
            Err(ConfigurationError::InvalidCache { .. })
        ));
    }

    #[test]
    fn from_file_reports_io_errors_and_names_unnamed_workflows() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            WorkflowParser::from_file(dir.path().join("missing.yml")),
            Err(ConfigurationError::Io { .. })
        ));

        let path = dir.path().join("lint.yml");
        fs::write(&path, "on: push\njobs:\n  a:\n    steps: [ { run: x } ]\n").unwrap();
        assert_eq!(WorkflowParser::from_file(&path).unwrap().name, "lint");
    }
}
