use super::CacheError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder};

/// A gzip-compressed tar of a job's cached paths, relative to its workspace.
#[derive(Clone)]
pub struct Snapshot {
    bytes: Arc<[u8]>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Snapshot {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Archive `paths` (relative to `workspace`). Missing paths are skipped.
    /// Symlinks are stored as links. Blocking.
    pub fn capture(workspace: &Path, paths: &[PathBuf]) -> Result<Self, CacheError> {
        let encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        for relative in paths {
            let full = workspace.join(relative);
            let meta = match std::fs::symlink_metadata(&full) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("cache path '{}' does not exist, skipping", full.display());
                    continue;
                }
                Err(e) => return Err(CacheError::io(&full, e)),
            };

            let result = if meta.is_dir() {
                builder.append_dir_all(relative, &full)
            } else {
                builder.append_path_with_name(&full, relative)
            };
            result.map_err(|e| CacheError::io(&full, e))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| CacheError::io(workspace, e))?;
        let bytes = encoder.finish().map_err(|e| CacheError::io(workspace, e))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Unpack into `workspace`, overwriting existing files. Blocking.
    pub fn restore(&self, workspace: &Path) -> Result<(), CacheError> {
        let mut archive = Archive::new(GzDecoder::new(self.as_bytes()));
        archive.set_overwrite(true);
        archive.set_preserve_permissions(true);
        archive
            .unpack(workspace)
            .map_err(|e| CacheError::io(workspace, e))
    }
}
