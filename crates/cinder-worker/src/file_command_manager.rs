// File-based commands a step uses to hand variables and PATH entries to the
// steps after it. The step appends to the files named by CINDER_ENV and
// CINDER_PATH; the manager applies them once the step exits.

use crate::environment::Environment;
use cinder_common::constants::variables;
use cinder_sdk::TraceWriter;
use std::path::{Path, PathBuf};

/// Paths of the command files handed to one step.
#[derive(Debug, Clone)]
pub struct FileCommands {
    pub env_file: PathBuf,
    pub path_file: PathBuf,
}

impl FileCommands {
    /// Variables pointing the step at its command files.
    pub fn variables(&self) -> [(String, String); 2] {
        [
            (
                variables::ENV_FILE.to_string(),
                self.env_file.to_string_lossy().into_owned(),
            ),
            (
                variables::PATH_FILE.to_string(),
                self.path_file.to_string_lossy().into_owned(),
            ),
        ]
    }
}

pub struct FileCommandManager;

impl FileCommandManager {
    /// Create empty command files in the job's temp directory.
    pub fn initialize(env: &Environment) -> std::io::Result<FileCommands> {
        let id = uuid::Uuid::new_v4().as_simple().to_string();
        let commands = FileCommands {
            env_file: env.temp().join(format!("env_{id}")),
            path_file: env.temp().join(format!("path_{id}")),
        };
        std::fs::write(&commands.env_file, "")?;
        std::fs::write(&commands.path_file, "")?;
        Ok(commands)
    }

    /// Apply whatever the step wrote, then delete the files.
    pub fn process(commands: &FileCommands, env: &mut Environment, trace: &dyn TraceWriter) {
        if let Some(content) = Self::read(&commands.env_file, trace) {
            Self::apply_env(&content, env, trace);
        }
        if let Some(content) = Self::read(&commands.path_file, trace) {
            Self::apply_path(&content, env, trace);
        }
        let _ = std::fs::remove_file(&commands.env_file);
        let _ = std::fs::remove_file(&commands.path_file);
    }

    fn read(path: &Path, trace: &dyn TraceWriter) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                trace.verbose(&format!("Failed to read file command '{}': {}", path.display(), e));
                None
            }
        }
    }

    /// Position of `<<` when it comes before any `=`, so `A=x<<y` stays a plain value.
    fn heredoc_marker(line: &str) -> Option<usize> {
        let pos = line.find("<<")?;
        match line.find('=') {
            Some(eq) if eq < pos => None,
            _ => Some(pos),
        }
    }

    /// `NAME=VALUE` lines, or `NAME<<DELIMITER` followed by value lines and
    /// the delimiter on its own line.
    fn apply_env(content: &str, env: &mut Environment, trace: &dyn TraceWriter) {
        let mut lines = content.lines();

        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }

            let (name, value) = if let Some(pos) = Self::heredoc_marker(line) {
                let name = line[..pos].trim();
                let delimiter = line[pos + 2..].trim();
                if name.is_empty() || delimiter.is_empty() {
                    trace.warning(&format!("Invalid heredoc in {}: {}", variables::ENV_FILE, line));
                    continue;
                }

                let mut value_lines = Vec::new();
                let mut terminated = false;
                for value_line in lines.by_ref() {
                    if value_line.trim_end_matches('\r') == delimiter {
                        terminated = true;
                        break;
                    }
                    value_lines.push(value_line);
                }
                if !terminated {
                    trace.warning(&format!(
                        "Heredoc for '{}' is missing its delimiter '{}'; ignoring",
                        name, delimiter
                    ));
                    break;
                }
                (name.to_string(), value_lines.join("\n"))
            } else if let Some(pos) = line.find('=') {
                let name = line[..pos].trim();
                if name.is_empty() {
                    trace.warning(&format!("Invalid env entry (empty name): {}", line));
                    continue;
                }
                (name.to_string(), line[pos + 1..].to_string())
            } else {
                trace.warning(&format!("Unrecognized {} line: {}", variables::ENV_FILE, line));
                continue;
            };

            if variables::reserved().contains(&name.as_str()) {
                trace.warning(&format!("Ignoring attempt to overwrite reserved variable '{name}'"));
                continue;
            }
            trace.verbose(&format!("{}: {}", variables::ENV_FILE, name));
            env.set_var(name, value);
        }
    }

    fn apply_path(content: &str, env: &mut Environment, trace: &dyn TraceWriter) {
        for line in content.lines() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                trace.verbose(&format!("{}: prepending {}", variables::PATH_FILE, trimmed));
                env.prepend_path(trimmed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_sdk::{CollectingTraceWriter, TraceLevel};
    use uuid::Uuid;

    fn setup() -> (tempfile::TempDir, Environment, FileCommands) {
        let work = tempfile::tempdir().unwrap();
        let env = Environment::prepare(work.path(), Uuid::new_v4(), "job", None).unwrap();
        let commands = FileCommandManager::initialize(&env).unwrap();
        (work, env, commands)
    }

    #[test]
    fn applies_simple_and_heredoc_entries() {
        let (_work, mut env, commands) = setup();
        std::fs::write(
            &commands.env_file,
            "MY_VAR=hello=world\nNOTES<<EOF\nline1\nline2\nEOF\n",
        )
        .unwrap();
        let trace = CollectingTraceWriter::new();

        FileCommandManager::process(&commands, &mut env, &trace);

        assert_eq!(env.var("MY_VAR"), Some("hello=world"));
        assert_eq!(env.var("NOTES"), Some("line1\nline2"));
        assert!(!commands.env_file.exists());
        assert!(!commands.path_file.exists());
    }

    #[test]
    fn value_containing_heredoc_marker_is_a_plain_assignment() {
        let (_work, mut env, commands) = setup();
        std::fs::write(&commands.env_file, "FLAGS=-x<<y\nNEXT=2\n").unwrap();
        let trace = CollectingTraceWriter::new();

        FileCommandManager::process(&commands, &mut env, &trace);

        assert_eq!(env.var("FLAGS"), Some("-x<<y"));
        assert_eq!(env.var("NEXT"), Some("2"));
        assert!(!trace.contains(TraceLevel::Warning, "missing its delimiter"));
    }

    #[test]
    fn unterminated_heredoc_is_ignored_with_warning() {
        let (_work, mut env, commands) = setup();
        std::fs::write(&commands.env_file, "KEPT=1\nBROKEN<<END\nvalue\n").unwrap();
        let trace = CollectingTraceWriter::new();

        FileCommandManager::process(&commands, &mut env, &trace);

        assert_eq!(env.var("KEPT"), Some("1"));
        assert_eq!(env.var("BROKEN"), None);
        assert!(trace.contains(TraceLevel::Warning, "missing its delimiter"));
    }

    #[test]
    fn reserved_variables_cannot_be_overwritten() {
        let (_work, mut env, commands) = setup();
        std::fs::write(&commands.env_file, "CINDER_WORKSPACE=/elsewhere\n").unwrap();
        let trace = CollectingTraceWriter::new();

        FileCommandManager::process(&commands, &mut env, &trace);

        assert_eq!(env.var(variables::WORKSPACE), None);
        assert!(trace.contains(TraceLevel::Warning, "CINDER_WORKSPACE"));
    }

    #[test]
    fn path_entries_are_prepended_in_order() {
        let (_work, mut env, commands) = setup();
        std::fs::write(&commands.path_file, "/opt/a\n\n/opt/b\n").unwrap();

        FileCommandManager::process(&commands, &mut env, &cinder_sdk::NullTraceWriter);

        assert_eq!(
            env.path_prepends(),
            &[PathBuf::from("/opt/b"), PathBuf::from("/opt/a")]
        );
    }
}
