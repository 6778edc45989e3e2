use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::cache::CacheStore;
use crate::error::StoreError;
use crate::model::CacheEntry;

/// Process-local cache store, used when no Redis URL is configured.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();

        if let Some(entry) = guard.get(key) {
            if entry.is_expired(now) {
                guard.remove(key);
                return Ok(None);
            }

            return Ok(Some(entry.clone()));
        }

        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| StoreError::new(format!("Invalid key pattern {}: {}", pattern, e)))?;

        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|key, _| !matcher.matches(key));
        Ok(before - guard.len())
    }

    async fn memory_usage(&self) -> Result<u64, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.values().map(|e| e.approx_size() as u64).sum())
    }
}
