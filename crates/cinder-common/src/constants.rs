// Well-known names shared by every cinder crate.

use std::fmt;

/// Well-known directories resolved through `HostContext::get_directory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Root,
    Work,
    Cache,
    Diag,
    Temp,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Settings file stored under the root directory.
pub const SETTINGS_FILE_NAME: &str = ".cinder";

/// Root directory used when neither `--root` nor `CINDER_ROOT` is given.
pub const DEFAULT_ROOT_DIRECTORY: &str = ".cinder-root";

/// Environment variable that overrides the root directory.
pub const ROOT_VARIABLE: &str = "CINDER_ROOT";

/// Path environment variable name (platform-specific).
#[cfg(target_os = "windows")]
pub const PATH_VARIABLE: &str = "Path";
#[cfg(not(target_os = "windows"))]
pub const PATH_VARIABLE: &str = "PATH";

/// Default step timeout when neither the step nor the job sets one (6 hours).
pub const DEFAULT_STEP_TIMEOUT_MINUTES: u64 = 360;

/// Number of trailing output lines kept on a failed step.
pub const FAILURE_OUTPUT_TAIL_LINES: usize = 20;

/// Default directory names, relative to the root.
pub mod path {
    pub const WORK_DIRECTORY: &str = "_work";
    pub const CACHE_DIRECTORY: &str = "_cache";
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const TEMP_DIRECTORY: &str = "_temp";
}

/// Variables exported to every step.
pub mod variables {
    pub const CI: &str = "CI";
    pub const JOB: &str = "CINDER_JOB";
    pub const RUN_ID: &str = "CINDER_RUN_ID";
    pub const WORKSPACE: &str = "CINDER_WORKSPACE";
    pub const TEMP: &str = "CINDER_TEMP";
    pub const EVENT_NAME: &str = "CINDER_EVENT_NAME";
    pub const REF_NAME: &str = "CINDER_REF_NAME";
    pub const HEAD_REF: &str = "CINDER_HEAD_REF";

    /// File commands: steps append to these files to affect later steps.
    pub const ENV_FILE: &str = "CINDER_ENV";
    pub const PATH_FILE: &str = "CINDER_PATH";

    /// Names a step may not override through the env file.
    pub fn reserved() -> &'static [&'static str] {
        &[JOB, RUN_ID, WORKSPACE, TEMP, ENV_FILE, PATH_FILE]
    }
}

/// Process exit codes of the `cinder` binary.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
    pub const RUN_CANCELLED: i32 = 3;
}
