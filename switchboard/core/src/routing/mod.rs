//! Multi-Provider Request Routing
//!
//! Picks a provider for every completion request, guards each provider with
//! a circuit breaker and a concurrency limiter, retries transient failures
//! and fails over when a provider is exhausted.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   RequestRouter   |  <-- Entry point for all completion requests
//! +---------+---------+
//!           |
//!           v
//! +-------------------+
//! | SelectionStrategy |  <-- cost / performance / quality / round-robin / weighted
//! +---------+---------+
//!           |
//!           v
//! +-------------------+     +--------------------+
//! | ConcurrencyLimiter| --> |   CircuitBreaker   |  <-- per provider
//! +---------+---------+     +---------+----------+
//!           |                         |
//!           v                         v
//! +-------------------+     +--------------------+
//! |   RetryPolicy     | --> |  ProviderAdapter   |
//! +-------------------+     +--------------------+
//! ```

pub mod breaker;
pub mod config;
pub mod limiter;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod stats;
pub mod strategy;

#[cfg(test)]
pub mod test_utils;

pub use breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::{BreakerConfig, LimiterConfig, ModelConfig, ProviderConfig, RetryConfig, StrategyKind};
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterStats, Permit};
pub use metrics::{RouterMetrics, RouterMetricsSnapshot};
pub use retry::{RetryDecision, RetryPolicy};
pub use router::{ProviderSnapshot, RequestRouter, RequestRouterBuilder, RoutedResponse, RouterStats};
pub use stats::{ProviderStats, ProviderStatsSnapshot, DEFAULT_STATS_WINDOW};
pub use strategy::{build_strategy, Candidate, SelectionStrategy};
