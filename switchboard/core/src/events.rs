//! Router Events
//!
//! Observability seam for the routing engine. Every routing decision, outcome,
//! failover, breaker transition, cache lookup and budget alert is published on
//! a bounded broadcast channel. Subscribers that fall behind lose the oldest
//! events instead of growing memory.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::ledger::BudgetScope;
use crate::routing::StrategyKind;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How a cached response was found
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheHitKind {
    /// Exact key match in the named layer
    Exact { layer: String },
    /// Similarity fallback above threshold
    Similar { similarity: f64 },
}

/// Events published by the router
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    RoutingDecision {
        request_id: String,
        provider: String,
        model: String,
        strategy: StrategyKind,
        estimated_cost: f64,
    },
    RequestSucceeded {
        request_id: String,
        provider: String,
        model: String,
        latency_ms: u64,
        cost: f64,
        attempts: u32,
    },
    RequestFailed {
        request_id: String,
        error: String,
    },
    FailoverTriggered {
        request_id: String,
        from: String,
        reason: String,
    },
    CircuitOpened {
        provider: String,
    },
    CircuitHalfOpen {
        provider: String,
    },
    CircuitClosed {
        provider: String,
    },
    CacheHit {
        request_id: String,
        provider: String,
        hit: CacheHitKind,
    },
    CacheMiss {
        request_id: String,
    },
    BudgetAlert {
        scope: BudgetScope,
        period: String,
        spent: f64,
        ceiling: f64,
        threshold: f64,
    },
    ProviderHealthChanged {
        provider: String,
        healthy: bool,
    },
}

impl RouterEvent {
    /// Short event name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoutingDecision { .. } => "routing_decision",
            Self::RequestSucceeded { .. } => "request_succeeded",
            Self::RequestFailed { .. } => "request_failed",
            Self::FailoverTriggered { .. } => "failover_triggered",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpen { .. } => "circuit_half_open",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::BudgetAlert { .. } => "budget_alert",
            Self::ProviderHealthChanged { .. } => "provider_health_changed",
        }
    }
}

/// Bounded fan-out of [`RouterEvent`]s
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
    published: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody is listening
    pub fn emit(&self, event: RouterEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(event = event.name(), "router event");
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events published since creation
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
