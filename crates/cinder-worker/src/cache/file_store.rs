use super::{CacheEntry, CacheError, CacheKey, CacheStore, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

const BLOB_EXTENSION: &str = "tar.gz";

/// One blob per key under a directory.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so readers only ever see complete blobs. Distinct keys share no
/// lock; concurrent writers of the same key race and the last rename wins.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{}", key.as_str(), BLOB_EXTENSION))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.blob_path(key);
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(CacheError::io(&path, e)),
            };
            let created_at = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(Some(CacheEntry {
                key,
                snapshot: Snapshot::from_bytes(bytes),
                created_at,
            }))
        })
        .await?
    }

    async fn put(&self, key: &CacheKey, snapshot: Snapshot) -> Result<(), CacheError> {
        let root = self.root.clone();
        let path = self.blob_path(key);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
            let mut temp =
                tempfile::NamedTempFile::new_in(&root).map_err(|e| CacheError::io(&root, e))?;
            temp.write_all(snapshot.as_bytes())
                .and_then(|_| temp.as_file().sync_all())
                .map_err(|e| CacheError::io(temp.path(), e))?;
            temp.persist(&path)
                .map_err(|e| CacheError::io(&path, e.error))?;
            Ok(())
        })
        .await?
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn key(job: &str) -> CacheKey {
        CacheKey::derive(job, "stable", &BTreeMap::new())
    }

    #[tokio::test]
    async fn miss_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("cache"));
        assert!(store.get(&key("check")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_returns_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("cache"));
        store
            .put(&key("check"), Snapshot::from_bytes(b"blob".to_vec()))
            .await
            .unwrap();

        let entry = store.get(&key("check")).await.unwrap().unwrap();
        assert_eq!(entry.key, key("check"));
        assert_eq!(entry.snapshot.as_bytes(), b"blob");
        assert!(entry.created_at <= Utc::now());
        assert!(store.get(&key("docs")).await.unwrap().is_none());

        // No temp files left behind.
        let files: Vec<_> = std::fs::read_dir(store.root()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_complete_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCacheStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let shared = store.clone();
            handles.push(tokio::spawn(async move {
                shared
                    .put(&key("tests"), Snapshot::from_bytes(vec![i; 4096]))
                    .await
            }));
            let own = store.clone();
            handles.push(tokio::spawn(async move {
                own
                    .put(&key(&format!("job{i}")), Snapshot::from_bytes(vec![i; 16]))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entry = store.get(&key("tests")).await.unwrap().unwrap();
        let bytes = entry.snapshot.as_bytes();
        assert_eq!(bytes.len(), 4096);
        assert!(bytes.iter().all(|b| *b == bytes[0]));
        for i in 0..8u8 {
            let other = store.get(&key(&format!("job{i}"))).await.unwrap().unwrap();
            assert_eq!(other.snapshot.as_bytes(), &[i; 16]);
        }
    }
}
