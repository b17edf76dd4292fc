//! Layered Response Cache
//!
//! Lookups walk the layers fastest first (memory, then SQLite, then the
//! pluggable distributed tier). The first hit wins and is copied back into
//! every faster layer. When no exact key matches, cached prompts for the
//! same (provider, model) are scored with a [`SimilarityMetric`] and the best
//! one at or above the threshold is served as a similar hit.
//!
//! Layer failures are logged and treated as misses; a broken cache never
//! fails a request.

mod key;
mod layer;
mod memory;
mod similarity;
mod sqlite;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use key::{normalize_prompt, CacheKey};
pub use layer::{CacheEntry, CacheError, CacheLayer, NoopLayer};
pub use memory::MemoryLayer;
pub use similarity::{Cosine, Jaccard, Levenshtein, SimilarityAlgorithm, SimilarityMetric};
pub use sqlite::SqliteLayer;

use crate::provider::{CompletionRequest, CompletionResponse, GenerationOptions};

/// Default similarity threshold for near-duplicate hits
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentCacheConfig {
    /// Database file; an in-memory database is used when unset
    pub path: Option<PathBuf>,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: 10_000,
            ttl_secs: 3_600,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub enabled: bool,
    pub algorithm: SimilarityAlgorithm,
    pub threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: SimilarityAlgorithm::default(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub memory: MemoryCacheConfig,
    pub persistent: PersistentCacheConfig,
    /// TTL for entries written to the distributed layer
    pub distributed_ttl_secs: u64,
    pub similarity: SimilarityConfig,
    /// Interval of the background expired-entry sweep; 0 disables it
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory: MemoryCacheConfig::default(),
            persistent: PersistentCacheConfig::default(),
            distributed_ttl_secs: 86_400,
            similarity: SimilarityConfig::default(),
            cleanup_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

// ============================================================================
// Lookup results and stats
// ============================================================================

/// Outcome of [`CacheEngine::lookup`]
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Exact { entry: CacheEntry, layer: String },
    Similar { entry: CacheEntry, similarity: f64 },
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub similar_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub backfills: u64,
    pub layer_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.exact_hits + self.similar_hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            (self.exact_hits + self.similar_hits) as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    backfills: AtomicU64,
    layer_errors: AtomicU64,
}

// ============================================================================
// Engine
// ============================================================================

/// Multi-layer response cache
pub struct CacheEngine {
    config: CacheConfig,
    layers: Vec<Arc<dyn CacheLayer>>,
    metric: Box<dyn SimilarityMetric>,
    counters: Counters,
}

impl CacheEngine {
    /// Memory and SQLite layers plus the no-op distributed layer
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_distributed(config, Arc::new(NoopLayer))
    }

    /// Memory and SQLite layers plus `distributed` as layer 3
    pub fn with_distributed(config: CacheConfig, distributed: Arc<dyn CacheLayer>) -> Result<Self, CacheError> {
        let memory = MemoryLayer::new(
            config.memory.max_entries,
            Duration::from_secs(config.memory.ttl_secs),
        );
        let persistent_ttl = Duration::from_secs(config.persistent.ttl_secs);
        let persistent = match &config.persistent.path {
            Some(path) => SqliteLayer::open(path, config.persistent.max_entries, persistent_ttl)?,
            None => SqliteLayer::in_memory(config.persistent.max_entries, persistent_ttl)?,
        };

        let layers: Vec<Arc<dyn CacheLayer>> = vec![Arc::new(memory), Arc::new(persistent), distributed];
        Ok(Self::with_layers(config, layers))
    }

    /// Explicit layer stack, fastest first
    pub fn with_layers(config: CacheConfig, layers: Vec<Arc<dyn CacheLayer>>) -> Self {
        tracing::debug!(
            layers = ?layers.iter().map(|l| l.name().to_string()).collect::<Vec<_>>(),
            similarity = %config.similarity.algorithm,
            "Cache engine initialized"
        );
        Self {
            metric: config.similarity.algorithm.metric(),
            config,
            layers,
            counters: Counters::default(),
        }
    }

    /// Replace the similarity metric
    #[must_use]
    pub fn with_metric(mut self, metric: Box<dyn SimilarityMetric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name().to_string()).collect()
    }

    fn layer_error(&self, layer: &dyn CacheLayer, op: &str, error: &CacheError) {
        self.counters.layer_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(layer = layer.name(), op, error = %error, "Cache layer failed");
    }

    /// Exact lookup; the hit is back-filled into every faster layer with an
    /// expiry no later than the source entry's
    pub async fn get(&self, key: &CacheKey) -> Option<(CacheEntry, String)> {
        for (depth, layer) in self.layers.iter().enumerate() {
            let entry = match layer.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    self.layer_error(layer.as_ref(), "get", &e);
                    continue;
                }
            };

            for faster in &self.layers[..depth] {
                if let Err(e) = faster.set(entry.clamped_to(faster.ttl())).await {
                    self.layer_error(faster.as_ref(), "backfill", &e);
                } else {
                    self.counters.backfills.fetch_add(1, Ordering::Relaxed);
                }
            }
            return Some((entry, layer.name().to_string()));
        }
        None
    }

    /// Write `value` to every layer, each with its own TTL
    pub async fn set(
        &self,
        key: &CacheKey,
        value: &CompletionResponse,
        provider: &str,
        model: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) {
        let prompt = normalize_prompt(prompt);
        for layer in &self.layers {
            let entry = CacheEntry::new(key, value.clone(), provider, model, prompt.clone(), layer.ttl())
                .with_options(*options);
            if let Err(e) = layer.set(entry).await {
                self.layer_error(layer.as_ref(), "set", &e);
            }
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Best cached entry for (provider, model), generated with the same
    /// sampling options, whose prompt scores at or above the similarity
    /// threshold
    pub async fn find_similar(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        provider: &str,
        model: &str,
    ) -> Option<(CacheEntry, f64)> {
        let prompt = normalize_prompt(prompt);
        let threshold = self.config.similarity.threshold;
        let mut seen = HashSet::new();
        let mut best: Option<(CacheEntry, f64)> = None;

        for layer in &self.layers {
            let candidates = match layer.scan(provider, model).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    self.layer_error(layer.as_ref(), "scan", &e);
                    continue;
                }
            };
            for entry in candidates {
                if !entry.generated_with(options) || !seen.insert(entry.key.clone()) {
                    continue;
                }
                let score = self.metric.similarity(&prompt, &entry.prompt);
                if score >= threshold && best.as_ref().map_or(true, |(_, s)| score > *s) {
                    best = Some((entry, score));
                }
            }
        }
        best
    }

    /// Exact key first, then similarity fallback. Updates hit/miss counters.
    pub async fn lookup(&self, request: &CompletionRequest, provider: &str, model: &str) -> CacheLookup {
        self.lookup_any(request, &[(provider, model)]).await
    }

    /// Lookup across several (provider, model) targets, in order. Any exact
    /// hit beats every similar hit; counts as a single lookup.
    pub async fn lookup_any(&self, request: &CompletionRequest, targets: &[(&str, &str)]) -> CacheLookup {
        for (provider, model) in targets {
            let key = CacheKey::for_request(request, provider, model);
            if let Some((entry, layer)) = self.get(&key).await {
                self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Exact { entry, layer };
            }
        }

        if self.config.similarity.enabled {
            let prompt = request.prompt_text();
            let mut best: Option<(CacheEntry, f64)> = None;
            for (provider, model) in targets {
                if let Some((entry, score)) = self.find_similar(&prompt, &request.options, provider, model).await {
                    if best.as_ref().map_or(true, |(_, s)| score > *s) {
                        best = Some((entry, score));
                    }
                }
            }
            if let Some((entry, similarity)) = best {
                self.counters.similar_hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Similar { entry, similarity };
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss
    }

    /// Cache a response generated for `request` on (provider, model)
    pub async fn store(&self, request: &CompletionRequest, provider: &str, model: &str, value: &CompletionResponse) {
        let key = CacheKey::for_request(request, provider, model);
        self.set(&key, value, provider, model, &request.prompt_text(), &request.options)
            .await;
    }

    /// Purge expired entries from every layer; returns the total removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        for layer in &self.layers {
            match layer.cleanup_expired().await {
                Ok(n) => removed += n,
                Err(e) => self.layer_error(layer.as_ref(), "cleanup", &e),
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Expired cache entries purged");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.counters.similar_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            backfills: self.counters.backfills.load(Ordering::Relaxed),
            layer_errors: self.counters.layer_errors.load(Ordering::Relaxed),
        }
    }

    pub async fn clear(&self) {
        for layer in &self.layers {
            if let Err(e) = layer.clear().await {
                self.layer_error(layer.as_ref(), "clear", &e);
            }
        }
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("layers", &self.layer_names())
            .field("metric", &self.metric.name())
            .finish_non_exhaustive()
    }
}
