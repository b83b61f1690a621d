//! The explicit environment handle every step of a job runs in.

use cinder_common::constants::PATH_VARIABLE;
use cinder_sdk::IOUtil;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const WORKSPACE_DIRECTORY: &str = "workspace";
const TEMP_DIRECTORY: &str = "temp";

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to prepare job directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy source '{source_dir}' into the job workspace: {error:#}")]
    Checkout {
        source_dir: PathBuf,
        error: anyhow::Error,
    },

    #[error("failed to remove job directory: {0:#}")]
    Teardown(anyhow::Error),
}

/// Isolated per-job state: a private workspace, a temp directory, the
/// variable map and PATH additions accumulated by earlier steps.
///
/// Steps receive it by `&mut` and see each other's changes in order.
#[derive(Debug)]
pub struct Environment {
    job_name: String,
    root: PathBuf,
    workspace: PathBuf,
    temp: PathBuf,
    vars: BTreeMap<String, String>,
    /// Newest first.
    path_prepends: Vec<PathBuf>,
}

impl Environment {
    /// Create `<work>/<run-id>/<job>/{workspace,temp}`, copying `source` into
    /// the workspace when given. Any leftover directory is wiped first.
    /// Blocking.
    pub fn prepare(
        work_dir: &Path,
        run_id: Uuid,
        job_name: &str,
        source: Option<&Path>,
    ) -> Result<Self, EnvironmentError> {
        let root = work_dir
            .join(run_id.as_simple().to_string())
            .join(IOUtil::sanitize_file_name(job_name));
        let workspace = root.join(WORKSPACE_DIRECTORY);
        let temp = root.join(TEMP_DIRECTORY);

        IOUtil::delete_directory(&root).map_err(EnvironmentError::Teardown)?;
        for dir in [&workspace, &temp] {
            std::fs::create_dir_all(dir).map_err(|source| EnvironmentError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        if let Some(source) = source {
            if !source.is_dir() {
                return Err(EnvironmentError::Checkout {
                    source_dir: source.to_path_buf(),
                    error: anyhow::anyhow!("source directory does not exist"),
                });
            }
            let exclude = Self::nested_work_dir(source, work_dir);
            let exclude: Vec<&str> = exclude.iter().map(String::as_str).collect();
            IOUtil::copy_directory(source, &workspace, &exclude).map_err(|error| {
                EnvironmentError::Checkout {
                    source_dir: source.to_path_buf(),
                    error,
                }
            })?;
        }

        Ok(Self {
            job_name: job_name.to_string(),
            root,
            workspace,
            temp,
            vars: BTreeMap::new(),
            path_prepends: Vec::new(),
        })
    }

    /// When the work directory lives inside the source tree, the top-level
    /// entry containing it must not be copied into itself.
    fn nested_work_dir(source: &Path, work_dir: &Path) -> Option<String> {
        let source = source.canonicalize().ok()?;
        let work = work_dir.canonicalize().ok()?;
        let relative = work.strip_prefix(&source).ok()?;
        relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    /// Directory holding both the workspace and temp folders.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn extend_vars<'a>(&mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Put `dir` in front of every later step's PATH.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) {
        self.path_prepends.insert(0, dir.into());
    }

    pub fn path_prepends(&self) -> &[PathBuf] {
        &self.path_prepends
    }

    /// Variables to overlay on the inherited process environment for one
    /// step: job variables, then the step's own, then the composed PATH.
    pub fn process_environment(
        &self,
        step_env: &BTreeMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self
            .vars
            .iter()
            .chain(step_env.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !self.path_prepends.is_empty() {
            let base = env
                .get(PATH_VARIABLE)
                .cloned()
                .or_else(|| std::env::var(PATH_VARIABLE).ok())
                .unwrap_or_default();
            let mut parts: Vec<String> = self
                .path_prepends
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            if !base.is_empty() {
                parts.push(base);
            }
            env.insert(PATH_VARIABLE.to_string(), parts.join(PATH_SEPARATOR));
        }

        env
    }

    /// Absolute working directory for a step.
    pub fn working_directory(&self, relative: Option<&Path>) -> PathBuf {
        match relative {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }

    /// Remove the job directory. Blocking.
    pub fn teardown(self) -> Result<(), EnvironmentError> {
        IOUtil::delete_directory(&self.root).map_err(EnvironmentError::Teardown)
    }
}
