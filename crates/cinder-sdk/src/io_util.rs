use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::{fs, thread, time::Duration};
use walkdir::WalkDir;

/// Filesystem helpers shared by the workspace, cache and settings code.
pub struct IOUtil;

impl IOUtil {
    /// Recursively delete a directory with retry logic.
    ///
    /// If the initial removal fails (e.g. due to a process still writing into
    /// the tree), the function retries up to 3 times with a growing delay.
    pub fn delete_directory(path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };

        if meta.file_type().is_symlink() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove symlink '{}'", path.display()))?;
            return Ok(());
        }

        let max_retries = 3;
        let mut attempt = 0;
        loop {
            if let Err(e) = Self::make_writable_recursive(path) {
                tracing::debug!(
                    "Failed to reset permissions (attempt {}): {}",
                    attempt + 1,
                    e
                );
            }

            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < max_retries => {
                    tracing::debug!("Delete of '{}' failed, retrying: {}", path.display(), e);
                    attempt += 1;
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to delete directory '{}' after {} retries",
                            path.display(),
                            max_retries
                        )
                    })
                }
            }
        }
    }

    /// Create `path` and all its parents if missing.
    pub fn ensure_directory(path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory '{}'", path.display()))
    }

    /// Copy the tree under `source` into `destination`.
    ///
    /// Top-level entries named in `exclude` are skipped. Symlinks are recreated
    /// as symlinks rather than followed.
    pub fn copy_directory(source: &Path, destination: &Path, exclude: &[&str]) -> Result<u64> {
        Self::ensure_directory(destination)?;
        let mut copied = 0u64;

        let walker = WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() == 1
                    && entry
                        .file_name()
                        .to_str()
                        .map(|name| exclude.contains(&name))
                        .unwrap_or(false))
            });

        for entry in walker {
            let entry = entry
                .with_context(|| format!("Failed to walk '{}'", source.display()))?;
            let relative = entry.path().strip_prefix(source)?;
            let target = destination.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                Self::ensure_directory(&target)?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                Self::create_symlink(&link, &target)?;
            } else {
                fs::copy(entry.path(), &target).with_context(|| {
                    format!(
                        "Failed to copy '{}' to '{}'",
                        entry.path().display(),
                        target.display()
                    )
                })?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    /// Serialize a value as JSON and write it to a file.
    pub fn save_object<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json.as_bytes())
            .with_context(|| format!("Failed to write object to '{}'", path.display()))?;
        Ok(())
    }

    /// Read a file and deserialize it from JSON.
    pub fn load_object<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read file '{}'", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize JSON from '{}'", path.display()))?;
        Ok(value)
    }

    /// Replace characters that are awkward in file names with `_`.
    pub fn sanitize_file_name(file_name: &str) -> String {
        let invalid: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', ' '];
        let result: String = file_name
            .chars()
            .map(|ch| {
                if invalid.contains(&ch) || ch.is_control() {
                    '_'
                } else {
                    ch
                }
            })
            .collect();
        if result.is_empty() {
            "_".to_string()
        } else {
            result
        }
    }

    #[cfg(unix)]
    fn create_symlink(link: &Path, target: &Path) -> Result<()> {
        std::os::unix::fs::symlink(link, target)
            .with_context(|| format!("Failed to create symlink '{}'", target.display()))
    }

    #[cfg(not(unix))]
    fn create_symlink(link: &Path, target: &Path) -> Result<()> {
        fs::copy(link, target)
            .map(|_| ())
            .with_context(|| format!("Failed to copy '{}'", link.display()))
    }

    fn make_writable_recursive(path: &Path) -> Result<()> {
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_symlink() {
                continue;
            }
            let mut perms = entry.metadata()?.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                fs::set_permissions(entry.path(), perms)?;
            }
        }
        Ok(())
    }
}
