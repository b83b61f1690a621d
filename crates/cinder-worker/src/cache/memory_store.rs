use super::{CacheEntry, CacheError, CacheKey, CacheStore, Snapshot};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

/// Process-local store backed by a sharded map.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &CacheKey, snapshot: Snapshot) -> Result<(), CacheError> {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                snapshot,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
