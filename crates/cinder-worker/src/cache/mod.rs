//! Content-addressed dependency cache.
//!
//! A [`CacheKey`] is derived from the job identity, its toolchain and the
//! contents of its lock files. The value stored under it is a [`Snapshot`]
//! of the job's cached paths. Stores must tolerate concurrent use from
//! parallel jobs; writes to the same key are last-writer-wins.

mod file_store;
mod key;
mod memory_store;
mod snapshot;

pub use file_store::FileCacheStore;
pub use key::CacheKey;
pub use memory_store::MemoryCacheStore;
pub use snapshot::Snapshot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key-files pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("cache worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A stored snapshot and when it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub snapshot: Snapshot,
    pub created_at: DateTime<Utc>,
}

/// Key/value store of environment snapshots.
///
/// A miss is `Ok(None)`, never an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, key: &CacheKey, snapshot: Snapshot) -> Result<(), CacheError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
