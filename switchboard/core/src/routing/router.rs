//! Request Router
//!
//! Entry point for completion requests. A request flows through:
//!
//! ```text
//! submit
//!   -> validate
//!   -> cache lookup (exact, then similar)          hit -> respond
//!   -> eligibility filter -> strategy selection
//!   -> budget reservation                           hard limit -> BudgetExceeded
//!   -> limiter acquire (FIFO queue, deadline aware)
//!   -> breaker admit -> adapter call, retried with backoff
//!   -> provider exhausted -> failover to the next eligible provider
//!   -> success -> cache set + usage tracking -> respond
//! ```
//!
//! The request deadline bounds every wait: queueing, the adapter call and
//! retry backoff. A call cut off by the deadline counts as a breaker failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::breaker::{Admission, BreakerSnapshot, CircuitBreakerRegistry};
use super::config::{ProviderConfig, StrategyKind};
use super::limiter::{ConcurrencyLimiter, LimiterError, LimiterStats};
use super::metrics::{RouterMetrics, RouterMetricsSnapshot};
use super::retry::{RetryDecision, RetryPolicy};
use super::stats::{ProviderStats, ProviderStatsSnapshot};
use super::strategy::{build_strategy, Candidate, SelectionStrategy};
use crate::cache::{CacheEngine, CacheLayer, CacheLookup, CacheStats, NoopLayer, SimilarityMetric};
use crate::config::{ConfigError, RouterConfig};
use crate::error::RouterError;
use crate::events::{CacheHitKind, EventBus, RouterEvent};
use crate::ledger::{BudgetStatus, MemoryUsageStore, SqliteUsageStore, TokenTracker, UsageEvent, UsageStore};
use crate::provider::{
    CompletionRequest, CompletionResponse, ProviderAdapter, ProviderError, StreamChunk, TokenCounts,
};

/// Buffer between an adapter's stream and the router's forwarder
const STREAM_BUFFER: usize = 32;

// ============================================================================
// Public types
// ============================================================================

/// A completed request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutedResponse {
    pub request_id: String,
    pub response: CompletionResponse,
    /// Provider that produced (or originally produced, for cache hits) the response
    pub provider: String,
    pub model: String,
    /// Cost of the successful attempt; 0 for cache hits
    pub cost: f64,
    pub latency_ms: u64,
    /// Provider attempts across retries and failover; 0 for cache hits
    pub attempts: u32,
    pub cache_hit: Option<CacheHitKind>,
}

/// Per-provider view in [`RouterStats`]
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSnapshot {
    pub provider_id: String,
    pub healthy: bool,
    pub breaker: Option<BreakerSnapshot>,
    pub limiter: Option<LimiterStats>,
    pub stats: ProviderStatsSnapshot,
}

/// Point-in-time view of the whole router
#[derive(Clone, Debug, Serialize)]
pub struct RouterStats {
    pub running: bool,
    pub strategy: StrategyKind,
    pub requests: RouterMetricsSnapshot,
    pub cache: CacheStats,
    pub providers: Vec<ProviderSnapshot>,
    pub budget: BudgetStatus,
    pub events_published: u64,
}

// ============================================================================
// Provider handle
// ============================================================================

struct ProviderHandle {
    config: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
    retry: RetryPolicy,
    stats: ProviderStats,
    healthy: AtomicBool,
}

impl ProviderHandle {
    fn id(&self) -> &str {
        &self.config.id
    }
}

/// Reports an admitted attempt's outcome to its breaker, and releases a
/// half-open trial slot if the attempt is dropped before it reports
struct TrialGuard<'a> {
    breakers: &'a CircuitBreakerRegistry,
    provider: &'a str,
    admission: Admission,
    settled: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breakers: &'a CircuitBreakerRegistry, provider: &'a str, admission: Admission) -> Self {
        Self {
            breakers,
            provider,
            admission,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breakers.record_success(self.provider, self.admission);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breakers.record_failure(self.provider, self.admission);
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.abandon_trial(self.provider, self.admission);
        }
    }
}

/// Outcome of one provider's attempt loop
struct ProviderSuccess {
    response: CompletionResponse,
    cost: f64,
    latency_ms: u64,
}

/// Per-request routing state
struct Dispatch<'a> {
    request: &'a CompletionRequest,
    deadline: Instant,
    timeout: Duration,
    chunks: Option<&'a mpsc::Sender<StreamChunk>>,
    attempts: u32,
    /// A failed attempt already streamed text to the caller
    stream_dirty: bool,
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    config: RouterConfig,
    providers: Vec<Arc<ProviderHandle>>,
    strategy: RwLock<Arc<dyn SelectionStrategy>>,
    breakers: CircuitBreakerRegistry,
    limiter: ConcurrencyLimiter,
    cache: CacheEngine,
    ledger: TokenTracker,
    events: Arc<EventBus>,
    metrics: RouterMetrics,
    running: AtomicBool,
}

/// Multi-provider request router
pub struct RequestRouter {
    inner: Arc<RouterInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`RequestRouter`]
pub struct RequestRouterBuilder {
    config: RouterConfig,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    distributed_cache: Option<Arc<dyn CacheLayer>>,
    usage_store: Option<Arc<dyn UsageStore>>,
    similarity: Option<Box<dyn SimilarityMetric>>,
}

impl RequestRouterBuilder {
    /// Register the adapter for a configured provider
    #[must_use]
    pub fn provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Use `layer` as the third cache tier instead of the no-op default
    #[must_use]
    pub fn distributed_cache(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.distributed_cache = Some(layer);
        self
    }

    /// Persist usage records to `store` instead of the configured ledger
    #[must_use]
    pub fn usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.usage_store = Some(store);
        self
    }

    /// Replace the configured similarity metric
    #[must_use]
    pub fn similarity_metric(mut self, metric: Box<dyn SimilarityMetric>) -> Self {
        self.similarity = Some(metric);
        self
    }

    /// Validate the configuration and wire up every component
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] for invalid configuration or a
    /// configured provider without an adapter, and [`RouterError::Storage`]
    /// when the cache or ledger database cannot be opened.
    pub fn build(self) -> Result<RequestRouter, RouterError> {
        let config = self.config;
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_capacity));
        let breakers = CircuitBreakerRegistry::with_events(events.clone());
        let limiter = ConcurrencyLimiter::new();

        let mut providers = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            let adapter = self
                .adapters
                .iter()
                .find(|a| a.id() == provider.id)
                .cloned()
                .ok_or_else(|| {
                    ConfigError::ValidationError(format!("no adapter registered for provider '{}'", provider.id))
                })?;

            breakers.register(provider.id.clone(), provider.breaker.clone());
            limiter.register(provider.id.clone(), provider.limits.clone());
            providers.push(Arc::new(ProviderHandle {
                config: provider.clone(),
                adapter,
                retry: RetryPolicy::new(provider.retry.clone()),
                stats: ProviderStats::new(config.stats_window),
                healthy: AtomicBool::new(true),
            }));
            tracing::info!(provider = %provider.id, models = provider.models.len(), "Registered provider");
        }
        for adapter in &self.adapters {
            if config.provider(adapter.id()).is_none() {
                tracing::warn!(provider = %adapter.id(), "Adapter has no provider configuration, ignoring");
            }
        }

        let distributed = self.distributed_cache.unwrap_or_else(|| Arc::new(NoopLayer));
        let mut cache = CacheEngine::with_distributed(config.cache.clone(), distributed)
            .map_err(|e| RouterError::Storage(e.to_string()))?;
        if let Some(metric) = self.similarity {
            cache = cache.with_metric(metric);
        }

        let store: Arc<dyn UsageStore> = match (self.usage_store, &config.ledger.path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                Arc::new(SqliteUsageStore::open(path).map_err(|e| RouterError::Storage(e.to_string()))?)
            }
            (None, None) => Arc::new(MemoryUsageStore::new()),
        };
        let ledger = TokenTracker::new(config.pricing_table(), config.budget.clone(), store)
            .with_events(events.clone());

        let strategy: Arc<dyn SelectionStrategy> = Arc::from(build_strategy(config.strategy));

        Ok(RequestRouter {
            inner: Arc::new(RouterInner {
                providers,
                strategy: RwLock::new(strategy),
                breakers,
                limiter,
                cache,
                ledger,
                events,
                metrics: RouterMetrics::new(),
                running: AtomicBool::new(false),
                config,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl RequestRouter {
    #[must_use]
    pub fn builder(config: RouterConfig) -> RequestRouterBuilder {
        RequestRouterBuilder {
            config,
            adapters: Vec::new(),
            distributed_cache: None,
            usage_store: None,
            similarity: None,
        }
    }

    /// Build a router with default cache and ledger wiring
    ///
    /// # Errors
    ///
    /// See [`RequestRouterBuilder::build`].
    pub fn new(config: RouterConfig, adapters: Vec<Arc<dyn ProviderAdapter>>) -> Result<Self, RouterError> {
        adapters
            .into_iter()
            .fold(Self::builder(config), RequestRouterBuilder::provider)
            .build()
    }

    /// Start accepting requests and spawn the health probe and cache sweep
    pub fn start(&self) -> Result<(), RouterError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(RouterError::AlreadyRunning);
        }

        let mut tasks = self.tasks.lock();
        if let Some(interval) = self.inner.config.health_check_interval() {
            tasks.push(self.spawn_health_checker(interval));
        }
        if self.inner.cache.is_enabled() {
            if let Some(interval) = self.inner.config.cache.cleanup_interval() {
                tasks.push(self.spawn_cache_janitor(interval));
            }
        }

        tracing::info!(
            providers = self.inner.providers.len(),
            strategy = %self.strategy(),
            "Request router started"
        );
        Ok(())
    }

    /// Stop accepting requests and cancel background tasks
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Request router stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn spawn_health_checker(&self, interval: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                inner.probe_health().await;
            }
        })
    }

    fn spawn_cache_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; nothing has expired yet
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.cache.cleanup_expired().await;
            }
        })
    }

    /// Route a request and wait for the complete response
    pub async fn submit(&self, request: CompletionRequest) -> Result<RoutedResponse, RouterError> {
        self.inner.dispatch(&request, None).await
    }

    /// Route a request, forwarding text deltas to `chunks` as they arrive
    ///
    /// If an attempt fails after streaming text, a [`StreamChunk::Restart`]
    /// is sent before the next attempt's deltas.
    pub async fn submit_streaming(
        &self,
        request: CompletionRequest,
        chunks: mpsc::Sender<StreamChunk>,
    ) -> Result<RoutedResponse, RouterError> {
        self.inner.dispatch(&request, Some(&chunks)).await
    }

    /// Swap the active strategy; the new one starts fresh
    pub fn set_strategy(&self, kind: StrategyKind) {
        *self.inner.strategy.write() = Arc::from(build_strategy(kind));
        tracing::info!(strategy = %kind, "Routing strategy changed");
    }

    /// Swap the active strategy by name
    pub fn set_strategy_by_name(&self, name: &str) -> Result<(), RouterError> {
        let kind = name
            .parse::<StrategyKind>()
            .map_err(|_| RouterError::UnknownStrategy(name.to_string()))?;
        self.set_strategy(kind);
        Ok(())
    }

    pub fn strategy(&self) -> StrategyKind {
        self.inner.strategy.read().kind()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    pub fn cache(&self) -> &CacheEngine {
        &self.inner.cache
    }

    pub fn ledger(&self) -> &TokenTracker {
        &self.inner.ledger
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Run one health probe round now
    pub async fn check_health(&self) {
        self.inner.probe_health().await;
    }

    pub fn stats(&self) -> RouterStats {
        let inner = &self.inner;
        RouterStats {
            running: self.is_running(),
            strategy: self.strategy(),
            requests: inner.metrics.snapshot(),
            cache: inner.cache.stats(),
            providers: inner
                .providers
                .iter()
                .map(|handle| ProviderSnapshot {
                    provider_id: handle.id().to_string(),
                    healthy: handle.healthy.load(Ordering::Relaxed),
                    breaker: inner.breakers.snapshot(handle.id()),
                    limiter: inner.limiter.stats(handle.id()),
                    stats: handle.stats.snapshot(),
                })
                .collect(),
            budget: inner.ledger.budget_status(),
            events_published: inner.events.published(),
        }
    }
}

impl Drop for RequestRouter {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field(
                "providers",
                &self.inner.providers.iter().map(|p| p.id()).collect::<Vec<_>>(),
            )
            .field("strategy", &self.strategy())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl RouterInner {
    fn handle(&self, provider_id: &str) -> Option<&Arc<ProviderHandle>> {
        self.providers.iter().find(|p| p.id() == provider_id)
    }

    async fn dispatch(
        &self,
        request: &CompletionRequest,
        chunks: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<RoutedResponse, RouterError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::NotRunning);
        }
        self.metrics.requests.inc();

        let result = match self.validate(request) {
            Ok(()) => self.route(request, chunks).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(routed) => {
                self.metrics.successes.inc();
                if routed.cache_hit.is_none() {
                    self.events.emit(RouterEvent::RequestSucceeded {
                        request_id: routed.request_id.clone(),
                        provider: routed.provider.clone(),
                        model: routed.model.clone(),
                        latency_ms: routed.latency_ms,
                        cost: routed.cost,
                        attempts: routed.attempts,
                    });
                }
            }
            Err(e) => {
                self.metrics.failures.inc();
                if matches!(e, RouterError::Timeout(_)) {
                    self.metrics.timeouts.inc();
                }
                tracing::debug!(request_id = %request.request_id, error = %e, "Request failed");
                self.events.emit(RouterEvent::RequestFailed {
                    request_id: request.request_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    fn validate(&self, request: &CompletionRequest) -> Result<(), RouterError> {
        if request.messages.is_empty() {
            return Err(RouterError::Validation("request has no messages".into()));
        }
        let temperature = request.options.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(RouterError::Validation(format!(
                "temperature must be between 0.0 and 2.0, got {temperature}"
            )));
        }
        if request.options.max_tokens == 0 {
            return Err(RouterError::Validation("max_tokens must be greater than 0".into()));
        }

        if let Some(id) = &request.provider {
            let Some(handle) = self.handle(id) else {
                return Err(RouterError::Validation(format!("unknown provider '{id}'")));
            };
            if let Some(model) = &request.model {
                if !handle.config.has_model(model) && !self.config.failover_on_override {
                    return Err(RouterError::Validation(format!(
                        "provider '{id}' does not offer model '{model}'"
                    )));
                }
            }
        }
        if let Some(model) = &request.model {
            if !self.providers.iter().any(|p| p.config.has_model(model)) {
                return Err(RouterError::Validation(format!("no provider offers model '{model}'")));
            }
        }
        Ok(())
    }

    /// Why `handle` cannot take `request` right now, or the model it would use
    fn eligibility(&self, handle: &ProviderHandle, request: &CompletionRequest) -> Result<String, String> {
        let missing = handle.config.capabilities.missing(&request.requires);
        if !missing.is_empty() {
            return Err(format!("missing capabilities: {}", missing.join(", ")));
        }
        let Some(model) = handle.config.resolve_model(request.model.as_deref()) else {
            return Err(format!(
                "model '{}' not offered",
                request.model.as_deref().unwrap_or_default()
            ));
        };
        if !handle.healthy.load(Ordering::Relaxed) {
            return Err("failed health check".into());
        }
        if !self.breakers.is_eligible(handle.id()) {
            return Err("circuit open".into());
        }
        if !self.limiter.has_capacity(handle.id()) {
            return Err("queue full".into());
        }
        Ok(model.to_string())
    }

    fn estimate_cost(&self, handle: &ProviderHandle, model: &str, request: &CompletionRequest) -> f64 {
        handle
            .adapter
            .estimate_cost(model, request)
            .unwrap_or_else(|| self.ledger.estimate_cost(handle.id(), model, request))
    }

    async fn route(
        &self,
        request: &CompletionRequest,
        chunks: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<RoutedResponse, RouterError> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or_else(|| self.config.default_timeout());

        if let Some(hit) = self.cached(request, chunks, started).await {
            return Ok(hit);
        }

        let mut dispatch = Dispatch {
            request,
            deadline: started + timeout,
            timeout,
            chunks,
            attempts: 0,
            stream_dirty: false,
        };
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<RouterError> = None;
        let mut pending_override = request.provider.clone();

        loop {
            if Instant::now() >= dispatch.deadline {
                return Err(RouterError::Timeout(timeout));
            }

            let preferred = match pending_override.take() {
                Some(id) => self.pick_override(&id, request)?,
                None => None,
            };
            let (handle, model) = match preferred {
                Some(choice) => choice,
                None => self.select(request, &excluded, &attempted, last_error.as_ref())?,
            };
            let provider_id = handle.id().to_string();
            let estimate = self.estimate_cost(&handle, &model, request);

            self.events.emit(RouterEvent::RoutingDecision {
                request_id: request.request_id.clone(),
                provider: provider_id.clone(),
                model: model.clone(),
                strategy: self.strategy.read().kind(),
                estimated_cost: estimate,
            });

            // Held until this provider's attempts are tracked
            let _hold = match self.ledger.reserve_budget(request.caller.as_deref(), estimate) {
                Ok(hold) => hold,
                Err(violation) => {
                    self.metrics.budget_rejections.inc();
                    return Err(violation.into());
                }
            };

            attempted.push(provider_id.clone());
            let error = match self.attempt_provider(&handle, &model, &mut dispatch).await {
                Ok(success) => {
                    if self.cache.is_enabled() && !request.skip_cache {
                        self.cache.store(request, &provider_id, &model, &success.response).await;
                    }
                    return Ok(RoutedResponse {
                        request_id: request.request_id.clone(),
                        response: success.response,
                        provider: provider_id,
                        model,
                        cost: success.cost,
                        latency_ms: success.latency_ms,
                        attempts: dispatch.attempts,
                        cache_hit: None,
                    });
                }
                Err(e) => e,
            };

            // Deadline, validation and budget failures end the request
            if matches!(
                error,
                RouterError::Timeout(_) | RouterError::Validation(_) | RouterError::BudgetExceeded { .. }
            ) {
                return Err(error);
            }
            if request.provider.as_deref() == Some(provider_id.as_str()) && !self.config.failover_on_override {
                return Err(error);
            }

            tracing::warn!(
                request_id = %request.request_id,
                provider = %provider_id,
                error = %error,
                "Provider exhausted, failing over"
            );
            self.metrics.failovers.inc();
            self.events.emit(RouterEvent::FailoverTriggered {
                request_id: request.request_id.clone(),
                from: provider_id.clone(),
                reason: error.to_string(),
            });
            excluded.insert(provider_id);
            last_error = Some(error);
        }
    }

    /// Resolve an explicit override. `Ok(None)` means fall back to normal
    /// selection (override ineligible and failover on override enabled).
    fn pick_override(
        &self,
        id: &str,
        request: &CompletionRequest,
    ) -> Result<Option<(Arc<ProviderHandle>, String)>, RouterError> {
        let Some(handle) = self.handle(id) else {
            return Err(RouterError::Validation(format!("unknown provider '{id}'")));
        };
        match self.eligibility(handle, request) {
            Ok(model) => Ok(Some((handle.clone(), model))),
            Err(reason) if self.config.failover_on_override => {
                tracing::debug!(provider = %id, reason = %reason, "Override ineligible, selecting another provider");
                Ok(None)
            }
            Err(reason) => Err(RouterError::ProviderUnavailable {
                provider: id.to_string(),
                reason,
            }),
        }
    }

    /// Run the active strategy over eligible, not-yet-tried providers
    fn select(
        &self,
        request: &CompletionRequest,
        excluded: &HashSet<String>,
        attempted: &[String],
        last_error: Option<&RouterError>,
    ) -> Result<(Arc<ProviderHandle>, String), RouterError> {
        let mut eligible = Vec::new();
        let mut candidates = Vec::new();
        let mut reasons = Vec::new();

        for handle in &self.providers {
            if excluded.contains(handle.id()) {
                continue;
            }
            match self.eligibility(handle, request) {
                Ok(model) => {
                    candidates.push(Candidate {
                        provider_id: handle.id().to_string(),
                        estimated_cost: self.estimate_cost(handle, &model, request),
                        avg_latency_ms: handle.stats.avg_latency_ms(),
                        p50_latency_ms: handle.stats.p50_latency_ms(),
                        success_rate: handle.stats.success_rate(),
                        weight: handle.config.weight,
                        model: model.clone(),
                    });
                    eligible.push((handle.clone(), model));
                }
                Err(reason) => reasons.push(format!("{}: {reason}", handle.id())),
            }
        }

        let strategy = self.strategy.read().clone();
        match strategy.select(&candidates) {
            Some(idx) if idx < eligible.len() => Ok(eligible.swap_remove(idx)),
            _ => Err(RouterError::AllProvidersExhausted {
                attempted: attempted.to_vec(),
                last_error: last_error
                    .map(ToString::to_string)
                    .or_else(|| (!reasons.is_empty()).then(|| reasons.join("; "))),
            }),
        }
    }

    /// Cache lookup over every provider that could serve the request
    async fn cached(
        &self,
        request: &CompletionRequest,
        chunks: Option<&mpsc::Sender<StreamChunk>>,
        started: Instant,
    ) -> Option<RoutedResponse> {
        if !self.cache.is_enabled() || request.skip_cache {
            return None;
        }

        let scope: Vec<(String, String)> = self
            .providers
            .iter()
            .filter(|p| request.provider.as_deref().map_or(true, |id| id == p.id()))
            .filter(|p| p.config.capabilities.satisfies(&request.requires))
            .filter_map(|p| {
                p.config
                    .resolve_model(request.model.as_deref())
                    .map(|m| (p.id().to_string(), m.to_string()))
            })
            .collect();
        let targets: Vec<(&str, &str)> = scope.iter().map(|(p, m)| (p.as_str(), m.as_str())).collect();

        let (entry, hit) = match self.cache.lookup_any(request, &targets).await {
            CacheLookup::Exact { entry, layer } => (entry, CacheHitKind::Exact { layer }),
            CacheLookup::Similar { entry, similarity } => (entry, CacheHitKind::Similar { similarity }),
            CacheLookup::Miss => {
                self.events.emit(RouterEvent::CacheMiss {
                    request_id: request.request_id.clone(),
                });
                return None;
            }
        };

        tracing::debug!(request_id = %request.request_id, provider = %entry.provider_id, ?hit, "Cache hit");
        self.events.emit(RouterEvent::CacheHit {
            request_id: request.request_id.clone(),
            provider: entry.provider_id.clone(),
            hit: hit.clone(),
        });
        if let Some(chunks) = chunks {
            let _ = chunks.send(StreamChunk::Delta(entry.value.content.clone())).await;
        }

        Some(RoutedResponse {
            request_id: request.request_id.clone(),
            response: entry.value,
            provider: entry.provider_id,
            model: entry.model_id,
            cost: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts: 0,
            cache_hit: Some(hit),
        })
    }

    /// Admission plus the retry loop on a single provider
    async fn attempt_provider(
        &self,
        handle: &ProviderHandle,
        model: &str,
        dispatch: &mut Dispatch<'_>,
    ) -> Result<ProviderSuccess, RouterError> {
        let provider_id = handle.id();
        let _permit = self
            .limiter
            .acquire(provider_id, Some(dispatch.deadline))
            .await
            .map_err(|e| match e {
                LimiterError::QueueFull(provider) => RouterError::QueueFull { provider },
                LimiterError::QueueTimeout(provider) => RouterError::QueueTimeout { provider },
                LimiterError::DeadlineExceeded(_) => RouterError::Timeout(dispatch.timeout),
                LimiterError::UnknownProvider(provider) => RouterError::ProviderUnavailable {
                    provider,
                    reason: "not registered".into(),
                },
            })?;

        let mut retries = 0u32;
        loop {
            let Some(admission) = self.breakers.try_admit(provider_id) else {
                return Err(RouterError::ProviderUnavailable {
                    provider: provider_id.to_string(),
                    reason: "circuit open".into(),
                });
            };
            let trial = TrialGuard::new(&self.breakers, provider_id, admission);

            if dispatch.stream_dirty {
                if let Some(chunks) = dispatch.chunks {
                    let _ = chunks
                        .send(StreamChunk::Restart {
                            provider: provider_id.to_string(),
                        })
                        .await;
                }
                dispatch.stream_dirty = false;
            }

            dispatch.attempts += 1;
            let started = Instant::now();
            let outcome = tokio::time::timeout_at(
                dispatch.deadline,
                self.call_adapter(handle, model, dispatch.request, dispatch.chunks, &mut dispatch.stream_dirty),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(Ok(response)) => {
                    trial.success();
                    handle.stats.record_success(latency_ms);
                    let cost = self.track(handle, model, dispatch.request, response.usage, latency_ms, true);
                    return Ok(ProviderSuccess {
                        response,
                        cost,
                        latency_ms,
                    });
                }
                Ok(Err(ProviderError::InvalidRequest(message))) => {
                    // The request is at fault, not the provider
                    drop(trial);
                    return Err(RouterError::Validation(message));
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    trial.failure();
                    handle.stats.record_failure();
                    self.track(handle, model, dispatch.request, TokenCounts::default(), latency_ms, false);
                    tracing::warn!(provider = %provider_id, timeout = ?dispatch.timeout, "Request deadline hit in flight");
                    return Err(RouterError::Timeout(dispatch.timeout));
                }
            };

            trial.failure();
            handle.stats.record_failure();
            self.track(handle, model, dispatch.request, TokenCounts::default(), latency_ms, false);

            match handle.retry.decide(&error, retries) {
                RetryDecision::RetryAfter(delay) if Instant::now() + delay < dispatch.deadline => {
                    retries += 1;
                    self.metrics.retries.inc();
                    tracing::debug!(
                        provider = %provider_id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(map_provider_error(provider_id, error)),
            }
        }
    }

    async fn call_adapter(
        &self,
        handle: &ProviderHandle,
        model: &str,
        request: &CompletionRequest,
        chunks: Option<&mpsc::Sender<StreamChunk>>,
        stream_dirty: &mut bool,
    ) -> Result<CompletionResponse, ProviderError> {
        let Some(out) = chunks else {
            return handle.adapter.complete(model, request).await;
        };

        let (tx, mut rx) = mpsc::channel::<String>(STREAM_BUFFER);
        let forward = async {
            let mut forwarded = false;
            while let Some(delta) = rx.recv().await {
                forwarded = true;
                let _ = out.send(StreamChunk::Delta(delta)).await;
            }
            forwarded
        };
        let (result, forwarded) = tokio::join!(handle.adapter.complete_streaming(model, request, tx), forward);
        if forwarded && result.is_err() {
            *stream_dirty = true;
        }
        result
    }

    fn track(
        &self,
        handle: &ProviderHandle,
        model: &str,
        request: &CompletionRequest,
        tokens: TokenCounts,
        latency_ms: u64,
        success: bool,
    ) -> f64 {
        let mut event = UsageEvent::new(handle.id(), model, tokens)
            .with_caller(request.caller.clone())
            .with_latency(latency_ms);
        if !success {
            event = event.failed();
        }
        self.ledger.track_usage(event)
    }

    async fn probe_health(&self) {
        let timeout = self.config.health_check_timeout();
        let probes = self.providers.iter().map(|handle| async move {
            let healthy = tokio::time::timeout(timeout, handle.adapter.health_check())
                .await
                .unwrap_or(false);
            (handle, healthy)
        });

        for (handle, healthy) in join_all(probes).await {
            let was = handle.healthy.swap(healthy, Ordering::Relaxed);
            if was == healthy {
                continue;
            }
            if healthy {
                tracing::info!(provider = %handle.id(), "Provider healthy again");
            } else {
                tracing::warn!(provider = %handle.id(), "Provider failed health check");
            }
            self.events.emit(RouterEvent::ProviderHealthChanged {
                provider: handle.id().to_string(),
                healthy,
            });
        }
    }
}

fn map_provider_error(provider: &str, error: ProviderError) -> RouterError {
    match error {
        ProviderError::RateLimited { retry_after } => RouterError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        ProviderError::InvalidRequest(message) => RouterError::Validation(message),
        other => RouterError::ProviderUnavailable {
            provider: provider.to_string(),
            reason: other.to_string(),
        },
    }
}
