// Persisted orchestrator settings, stored as JSON in `<root>/.cinder`.

use crate::constants::{path, DEFAULT_STEP_TIMEOUT_MINUTES, SETTINGS_FILE_NAME};

use anyhow::{Context, Result};
use cinder_sdk::IOUtil;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where cache entries live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// One blob per key under the cache directory; survives across runs.
    #[default]
    File,
    /// In-process map; discarded when the process exits.
    Memory,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(CacheBackend::File),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(format!("unknown cache backend '{other}', expected 'file' or 'memory'")),
        }
    }
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackend::File => write!(f, "file"),
            CacheBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Orchestrator configuration. Relative folders resolve against the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Per-job workspaces are created under this folder.
    #[serde(default = "default_work_folder", rename = "WorkFolder")]
    pub work_folder: String,

    #[serde(default = "default_cache_folder", rename = "CacheFolder")]
    pub cache_folder: String,

    /// Per-run job logs.
    #[serde(default = "default_diag_folder", rename = "DiagFolder")]
    pub diag_folder: String,

    #[serde(
        default = "default_step_timeout_minutes",
        rename = "DefaultStepTimeoutMinutes"
    )]
    pub default_step_timeout_minutes: u64,

    /// Leave job workspaces on disk after the run for inspection.
    #[serde(default, rename = "KeepWorkspaces")]
    pub keep_workspaces: bool,

    #[serde(default, rename = "CacheBackend")]
    pub cache_backend: CacheBackend,
}

fn default_work_folder() -> String {
    path::WORK_DIRECTORY.to_string()
}

fn default_cache_folder() -> String {
    path::CACHE_DIRECTORY.to_string()
}

fn default_diag_folder() -> String {
    path::DIAG_DIRECTORY.to_string()
}

fn default_step_timeout_minutes() -> u64 {
    DEFAULT_STEP_TIMEOUT_MINUTES
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            work_folder: default_work_folder(),
            cache_folder: default_cache_folder(),
            diag_folder: default_diag_folder(),
            default_step_timeout_minutes: default_step_timeout_minutes(),
            keep_workspaces: false,
            cache_backend: CacheBackend::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_minutes.max(1) * 60)
    }
}

/// Loads and saves [`OrchestratorSettings`].
pub struct ConfigurationStore {
    settings_file_path: PathBuf,
    settings: Mutex<Option<OrchestratorSettings>>,
}

impl ConfigurationStore {
    pub fn new(root: &Path) -> Self {
        Self {
            settings_file_path: root.join(SETTINGS_FILE_NAME),
            settings: Mutex::new(None),
        }
    }

    pub fn settings_file_path(&self) -> &Path {
        &self.settings_file_path
    }

    /// Whether a settings file exists on disk.
    pub fn is_configured(&self) -> bool {
        self.settings_file_path.exists()
    }

    /// Load settings, falling back to defaults when no file exists.
    /// Cached after first load.
    pub fn get_settings(&self) -> Result<OrchestratorSettings> {
        let mut guard = self.settings.lock();
        if let Some(ref settings) = *guard {
            return Ok(settings.clone());
        }

        let settings = if self.is_configured() {
            IOUtil::load_object(&self.settings_file_path).with_context(|| {
                format!(
                    "Failed to load settings from {}",
                    self.settings_file_path.display()
                )
            })?
        } else {
            OrchestratorSettings::default()
        };

        *guard = Some(settings.clone());
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &OrchestratorSettings) -> Result<()> {
        IOUtil::save_object(&self.settings_file_path, settings)?;
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }
}
