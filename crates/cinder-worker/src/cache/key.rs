use super::CacheError;
use cinder_common::CachePolicy;
use cinder_sdk::IOUtil;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Bumped whenever the digest layout or snapshot format changes.
const KEY_FORMAT_VERSION: &str = "cinder-cache-v1";

/// Deterministic cache key: `<job>-<sha256 hex>`.
///
/// The digest covers the format version, the job name, the toolchain
/// identity and every lock file's relative path and content hash, each
/// field NUL-terminated so no two distinct inputs share a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from already-hashed lock files.
    ///
    /// `lock_files` maps workspace-relative paths to the hex SHA-256 of each
    /// file's content. Iteration order is the map's sorted order.
    pub fn derive(job_name: &str, toolchain: &str, lock_files: &BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        for field in [KEY_FORMAT_VERSION, job_name, toolchain] {
            hasher.update(field.as_bytes());
            hasher.update(b"\0");
        }
        for (path, digest) in lock_files {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(digest.as_bytes());
            hasher.update(b"\0");
        }
        CacheKey(format!(
            "{}-{}",
            IOUtil::sanitize_file_name(job_name),
            hex::encode(hasher.finalize())
        ))
    }

    /// Fingerprint the lock state of `workspace` according to `policy`.
    ///
    /// Blocking: reads every matched file.
    pub fn from_lock_state(
        job_name: &str,
        policy: &CachePolicy,
        workspace: &Path,
    ) -> Result<Self, CacheError> {
        let lock_files = Self::hash_lock_files(workspace, &policy.key_files)?;
        tracing::debug!(
            job = job_name,
            files = lock_files.len(),
            "fingerprinted lock state"
        );
        Ok(Self::derive(job_name, &policy.toolchain, &lock_files))
    }

    /// Relative path → content hash for every file matched by `patterns`.
    pub fn hash_lock_files(
        workspace: &Path,
        patterns: &[String],
    ) -> Result<BTreeMap<String, String>, CacheError> {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let base = glob::Pattern::escape(&workspace.to_string_lossy());

        let mut files = BTreeMap::new();
        for pattern in patterns {
            let full = format!("{}/{}", base.trim_end_matches('/'), pattern);
            let entries = glob::glob_with(&full, options).map_err(|source| CacheError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;

            for entry in entries {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        let path = e.path().to_path_buf();
                        return Err(CacheError::io(path, e.into()));
                    }
                };
                if !path.is_file() {
                    continue;
                }
                let relative = match path.strip_prefix(workspace) {
                    Ok(r) => r
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    Err(_) => continue,
                };
                if files.contains_key(&relative) {
                    continue;
                }
                let content = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
                files.insert(relative, hex::encode(Sha256::digest(&content)));
            }
        }
        Ok(files)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
