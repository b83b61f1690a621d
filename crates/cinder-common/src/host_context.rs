// The application context shared by every component of one cinder process.

use crate::config_store::{ConfigurationStore, OrchestratorSettings};
use crate::constants::{self, WellKnownDirectory};
use crate::tracing::{TraceManager, Tracing};

use anyhow::Result;
use cinder_sdk::TraceWriter;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Root directory, settings, trace sources and the process-wide shutdown
/// token.
pub struct HostContext {
    root: PathBuf,
    settings: OrchestratorSettings,
    shutdown_token: CancellationToken,
    shutdown_reason: parking_lot::Mutex<Option<String>>,
    trace_manager: TraceManager,
}

impl HostContext {
    pub fn new(root: impl Into<PathBuf>, settings: OrchestratorSettings) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            settings,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: parking_lot::Mutex::new(None),
            trace_manager: TraceManager::default(),
        })
    }

    /// Create a context rooted at `root`, loading `<root>/.cinder` if present.
    pub fn load(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        let settings = ConfigurationStore::new(&root).get_settings()?;
        Ok(Self::new(root, settings))
    }

    /// The root directory: the explicit flag, else `CINDER_ROOT`, else
    /// `./.cinder-root`.
    pub fn resolve_root(flag: Option<&Path>) -> PathBuf {
        if let Some(root) = flag {
            return root.to_path_buf();
        }
        env::var(constants::ROOT_VARIABLE)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_ROOT_DIRECTORY))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Resolve the path for a well-known directory.
    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Root => self.root.clone(),
            WellKnownDirectory::Work => self.resolve(&self.settings.work_folder),
            WellKnownDirectory::Cache => self.resolve(&self.settings.cache_folder),
            WellKnownDirectory::Diag => self.resolve(&self.settings.diag_folder),
            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),
        }
    }

    fn resolve(&self, folder: &str) -> PathBuf {
        let path = Path::new(folder);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// Cancelled when the process is asked to stop (e.g. Ctrl-C).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown_reason.lock().clone()
    }

    /// Initiate shutdown: every run derived from the shutdown token is cancelled.
    pub fn shutdown(&self, reason: &str) {
        let trace = self.get_trace("HostContext");
        trace.info(&format!("cinder will shut down: {reason}"));
        *self.shutdown_reason.lock() = Some(reason.to_string());
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_resolve_against_root() {
        let host = HostContext::new("/srv/cinder", OrchestratorSettings::default());
        assert_eq!(
            host.get_directory(WellKnownDirectory::Work),
            PathBuf::from("/srv/cinder/_work")
        );
        assert_eq!(
            host.get_directory(WellKnownDirectory::Temp),
            PathBuf::from("/srv/cinder/_work/_temp")
        );
        assert_eq!(
            host.get_directory(WellKnownDirectory::Cache),
            PathBuf::from("/srv/cinder/_cache")
        );
    }

    #[test]
    fn absolute_folders_are_kept() {
        let settings = OrchestratorSettings {
            cache_folder: "/var/cache/cinder".into(),
            ..Default::default()
        };
        let host = HostContext::new("/srv/cinder", settings);
        assert_eq!(
            host.get_directory(WellKnownDirectory::Cache),
            PathBuf::from("/var/cache/cinder")
        );
    }

    #[test]
    fn explicit_root_flag_wins() {
        assert_eq!(
            HostContext::resolve_root(Some(Path::new("/opt/ci"))),
            PathBuf::from("/opt/ci")
        );
    }

    #[test]
    fn load_reads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(constants::SETTINGS_FILE_NAME),
            r#"{ "KeepWorkspaces": true }"#,
        )
        .unwrap();
        let host = HostContext::load(dir.path()).unwrap();
        assert!(host.settings().keep_workspaces);
    }

    #[test]
    fn shutdown_cancels_token() {
        let host = HostContext::new("/tmp", OrchestratorSettings::default());
        let token = host.shutdown_token();
        assert!(!token.is_cancelled());
        host.shutdown("ctrl-c");
        assert!(token.is_cancelled());
        assert_eq!(host.shutdown_reason().as_deref(), Some("ctrl-c"));
    }
}
