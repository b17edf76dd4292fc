//! Routing Configuration
//!
//! Per-provider settings for selection, circuit breaking, admission control
//! and retries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ledger::ModelPricing;
use crate::provider::Capabilities;

// ============================================================================
// Strategy Selection
// ============================================================================

/// Provider selection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Lowest estimated cost
    #[default]
    CostBased,
    /// Lowest rolling-average latency
    PerformanceBased,
    /// Highest rolling success rate
    QualityBased,
    /// Cycle through eligible providers
    RoundRobin,
    /// Weighted random draw
    Weighted,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        Self::CostBased,
        Self::PerformanceBased,
        Self::QualityBased,
        Self::RoundRobin,
        Self::Weighted,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CostBased => "cost-based",
            Self::PerformanceBased => "performance-based",
            Self::QualityBased => "quality-based",
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    /// Accepts the kebab-case names plus short and snake_case aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "cost-based" | "cost" => Ok(Self::CostBased),
            "performance-based" | "performance" | "latency" => Ok(Self::PerformanceBased),
            "quality-based" | "quality" => Ok(Self::QualityBased),
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            other => Err(other.to_string()),
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breaker thresholds for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// How long the circuit stays open before trial requests are admitted
    pub timeout_ms: u64,

    /// Concurrent trial requests admitted while half-open
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Admission Control
// ============================================================================

/// Concurrency limits for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Requests dispatched concurrently
    pub max_concurrent_requests: usize,

    /// Waiters allowed in the FIFO queue
    pub queue_size: usize,

    /// Longest a waiter stays queued
    pub queue_timeout_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            queue_size: 100,
            queue_timeout_ms: 30_000,
        }
    }
}

impl LimiterConfig {
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry configuration for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Upper bound on any delay
    pub max_delay_ms: u64,

    /// Delay growth per retry
    pub backoff_multiplier: f64,

    /// Add up to 25% jitter to each delay
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// A model offered by a provider, with its token prices
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier passed to the adapter
    pub id: String,

    /// Per-token prices
    #[serde(flatten)]
    pub pricing: ModelPricing,
}

impl ModelConfig {
    pub fn new(id: impl Into<String>, pricing: ModelPricing) -> Self {
        Self {
            id: id.into(),
            pricing,
        }
    }
}

/// Configuration for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider identifier (must match the adapter's `id()`)
    pub id: String,

    /// Model used when a request names none (first listed model when unset)
    pub default_model: Option<String>,

    /// Models and prices
    pub models: Vec<ModelConfig>,

    /// Weight for the weighted strategy
    pub weight: f64,

    /// What the provider supports
    pub capabilities: Capabilities,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// Admission limits
    pub limits: LimiterConfig,

    /// Retry behaviour
    pub retry: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            default_model: None,
            models: Vec::new(),
            weight: 1.0,
            capabilities: Capabilities::default(),
            breaker: BreakerConfig::default(),
            limits: LimiterConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Provider with a single model
    pub fn new(id: impl Into<String>, model: impl Into<String>, pricing: ModelPricing) -> Self {
        Self {
            id: id.into(),
            models: vec![ModelConfig::new(model, pricing)],
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.push(ModelConfig::new(model, pricing));
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_limits(mut self, limits: LimiterConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The model used when the request does not name one
    #[must_use]
    pub fn default_model(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .or_else(|| self.models.first().map(|m| m.id.as_str()))
    }

    #[must_use]
    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.id == model)
    }

    /// Resolve the model for a request: the requested model if offered here
    /// (`None` if not), or the default when nothing was requested
    #[must_use]
    pub fn resolve_model(&self, requested: Option<&str>) -> Option<&str> {
        match requested {
            Some(model) => self
                .models
                .iter()
                .find(|m| m.id == model)
                .map(|m| m.id.as_str()),
            None => self.default_model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("cost-based".parse::<StrategyKind>(), Ok(StrategyKind::CostBased));
        assert_eq!("round_robin".parse::<StrategyKind>(), Ok(StrategyKind::RoundRobin));
        assert_eq!("Quality".parse::<StrategyKind>(), Ok(StrategyKind::QualityBased));
        assert_eq!(
            "fastest".parse::<StrategyKind>(),
            Err("fastest".to_string())
        );
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_defaults() {
        let breaker = BreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.timeout(), Duration::from_secs(30));

        let limits = LimiterConfig::default();
        assert_eq!(limits.queue_timeout(), Duration::from_secs(30));

        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert!(!retry.use_jitter);
    }

    #[test]
    fn test_resolve_model() {
        let provider = ProviderConfig::new("a", "small", ModelPricing::default())
            .with_model("large", ModelPricing::default());

        assert_eq!(provider.default_model(), Some("small"));
        assert_eq!(provider.resolve_model(None), Some("small"));
        assert_eq!(provider.resolve_model(Some("large")), Some("large"));
        assert_eq!(provider.resolve_model(Some("missing")), None);
    }

    #[test]
    fn test_provider_toml_round_trip() {
        let toml_str = r#"
id = "anthropic"
default_model = "large"
weight = 2.5

[capabilities]
vision = true

[breaker]
failure_threshold = 3

[[models]]
id = "small"
input = 0.000001
output = 0.000002

[[models]]
id = "large"
input = 0.00001
output = 0.00003
thinking = 0.00003
"#;
        let provider: ProviderConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(provider.id, "anthropic");
        assert_eq!(provider.default_model(), Some("large"));
        assert_eq!(provider.models.len(), 2);
        assert!((provider.models[1].pricing.thinking - 0.00003).abs() < f64::EPSILON);
        assert!(provider.capabilities.vision);
        assert!(!provider.capabilities.streaming);
        assert_eq!(provider.breaker.failure_threshold, 3);
        assert_eq!(provider.breaker.success_threshold, 2);
        assert_eq!(provider.limits, LimiterConfig::default());
    }
}
