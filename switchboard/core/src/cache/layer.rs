//! Cache layer contract

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::key::{temperature_token, CacheKey};
use crate::provider::{CompletionResponse, GenerationOptions};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("cache entry could not be decoded: {0}")]
    Decode(String),
}

/// A cached response plus what it was generated for
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CompletionResponse,
    pub provider_id: String,
    pub model_id: String,
    /// Normalized prompt, kept for similarity lookups
    pub prompt: String,
    /// Sampling options the response was generated with
    #[serde(default)]
    pub options: GenerationOptions,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        key: &CacheKey,
        value: CompletionResponse,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        prompt: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            key: key.as_str().to_string(),
            value,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            prompt: prompt.into(),
            options: GenerationOptions::default(),
            created_at,
            expires_at: expires_after(created_at, ttl),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Whether this entry answers a request with `options`, compared at
    /// key precision
    pub fn generated_with(&self, options: &GenerationOptions) -> bool {
        self.options.max_tokens == options.max_tokens
            && temperature_token(self.options.temperature) == temperature_token(options.temperature)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Copy of this entry whose expiry is no later than `ttl` from now
    #[must_use]
    pub fn clamped_to(&self, ttl: Duration) -> Self {
        let mut entry = self.clone();
        entry.expires_at = entry.expires_at.min(expires_after(Utc::now(), ttl));
        entry
    }
}

fn expires_after(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One tier of the layered cache. Implementations treat expired entries as
/// absent.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Short name used in logs and hit events
    fn name(&self) -> &str;

    /// Entry lifetime for entries written to this layer
    fn ttl(&self) -> Duration;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Live entries generated by (provider, model), for similarity search
    async fn scan(&self, provider: &str, model: &str) -> Result<Vec<CacheEntry>, CacheError>;

    /// Drop expired entries, returning how many were removed
    async fn cleanup_expired(&self) -> Result<usize, CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Layer that stores nothing; the default distributed tier
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLayer;

#[async_trait]
impl CacheLayer for NoopLayer {
    fn name(&self) -> &str {
        "noop"
    }

    fn ttl(&self) -> Duration {
        Duration::ZERO
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn remove(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn scan(&self, _provider: &str, _model: &str) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(Vec::new())
    }

    async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokenCounts;

    #[test]
    fn test_entry_expiry_and_clamp() {
        let key = CacheKey::generate("q", "p", "m", 0.7, 10);
        let value = CompletionResponse::new("a", "m", TokenCounts::default());
        let entry = CacheEntry::new(&key, value, "p", "m", "q", Duration::from_secs(3600));

        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.expires_at));

        let clamped = entry.clamped_to(Duration::from_secs(60));
        assert!(clamped.expires_at < entry.expires_at);
        assert_eq!(entry.clamped_to(Duration::from_secs(7200)).expires_at, entry.expires_at);
    }

    #[test]
    fn test_generated_with_compares_sampling_options() {
        let key = CacheKey::generate("q", "p", "m", 0.2, 64);
        let value = CompletionResponse::new("a", "m", TokenCounts::default());
        let entry = CacheEntry::new(&key, value, "p", "m", "q", Duration::from_secs(60)).with_options(GenerationOptions {
            temperature: 0.2,
            max_tokens: 64,
        });

        assert!(entry.generated_with(&GenerationOptions {
            temperature: 0.200_01,
            max_tokens: 64,
        }));
        assert!(!entry.generated_with(&GenerationOptions {
            temperature: 0.9,
            max_tokens: 64,
        }));
        assert!(!entry.generated_with(&GenerationOptions {
            temperature: 0.2,
            max_tokens: 65,
        }));
    }

    #[tokio::test]
    async fn test_noop_layer_stores_nothing() {
        let layer = NoopLayer;
        let key = CacheKey::generate("q", "p", "m", 0.7, 10);
        let value = CompletionResponse::new("a", "m", TokenCounts::default());

        layer
            .set(CacheEntry::new(&key, value, "p", "m", "q", Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(layer.get(&key).await.unwrap().is_none());
        assert_eq!(layer.len().await.unwrap(), 0);
    }
}
