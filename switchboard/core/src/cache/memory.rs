//! In-process LRU tier

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use super::key::CacheKey;
use super::layer::{CacheEntry, CacheError, CacheLayer};

/// Bounded least-recently-used cache in memory
#[derive(Debug)]
pub struct MemoryLayer {
    capacity: NonZeroUsize,
    ttl: Duration,
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryLayer {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> &str {
        "memory"
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key.as_str()) {
            None => return Ok(None),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.clone())),
        };
        if expired {
            entries.pop(key.as_str());
        }
        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        // put() evicts the least recently used entry when full
        self.entries.lock().put(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.entries.lock().pop(key.as_str()).is_some())
    }

    async fn scan(&self, provider: &str, model: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let now = Utc::now();
        // iter() does not promote entries
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(_, entry)| entry)
            .filter(|e| e.provider_id == provider && e.model_id == model)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        Ok(expired.len())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.lock().len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}
