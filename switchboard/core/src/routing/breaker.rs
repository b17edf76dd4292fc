//! Circuit Breaker
//!
//! Per-provider circuit breaking so a degraded provider is not hammered while
//! it recovers.
//!
//! ```text
//! +--------+  failure_threshold  +------+       timeout        +-----------+
//! | Closed | ------------------> | Open | -------------------> | Half-Open |
//! +--------+                     +------+                      +-----------+
//!     ^                              ^          any failure          |
//!     |                              +-------------------------------+
//!     |              success_threshold successes                     |
//!     +--------------------------------------------------------------+
//! ```
//!
//! - **Closed**: requests flow, consecutive failures are counted
//! - **Open**: every request is rejected until the timeout elapses
//! - **Half-Open**: up to `half_open_requests` concurrent trials are admitted
//!
//! The Open to Half-Open transition is lazy: it happens on the first
//! eligibility check after the timeout.
//!
//! Every admitted dispatch carries an [`Admission`] naming the open cycle it
//! was admitted in and whether it holds a trial slot. Only trials of the
//! current cycle free slots or count toward closing; a call admitted while
//! Closed that finishes during Half-Open can still reopen the circuit on
//! failure, but its success is ignored.
//!
//! Each breaker serializes its own transitions behind a short
//! `parking_lot::Mutex`; the registry is a `DashMap` so unrelated providers
//! never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::config::BreakerConfig;
use crate::events::{EventBus, RouterEvent};

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting requests
    Open,

    /// Admitting limited trial requests
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Ticket for one admitted dispatch, handed back with its outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    generation: u64,
    trial: bool,
}

impl Admission {
    /// Whether this dispatch holds a half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// A state change produced by a breaker operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    // Bumped on every open and reset; stale trials no longer match
    generation: u64,
}

impl BreakerState {
    fn is_current_trial(&self, admission: Admission) -> bool {
        self.state == CircuitState::HalfOpen && admission.trial && admission.generation == self.generation
    }
}

/// Circuit breaker for a single provider
pub struct CircuitBreaker {
    provider_id: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            state: Mutex::new(BreakerState::default()),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without applying the lazy Open to Half-Open move
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Move Open to Half-Open once the timeout has elapsed
    fn refresh(&self, state: &mut BreakerState) -> Option<Transition> {
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state.opened_at.map_or(Duration::MAX, |t| t.elapsed());
        if elapsed < self.config.timeout() {
            return None;
        }

        state.state = CircuitState::HalfOpen;
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        Some(Transition::HalfOpened)
    }

    fn admits(&self, state: &BreakerState) -> bool {
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => state.half_open_in_flight < self.config.half_open_requests,
        }
    }

    /// Whether a dispatch would currently be admitted
    pub fn is_eligible(&self) -> (bool, Option<Transition>) {
        let mut state = self.state.lock();
        let transition = self.refresh(&mut state);
        (self.admits(&state), transition)
    }

    /// Admit a dispatch, reserving a trial slot when half-open
    pub fn try_admit(&self) -> (Option<Admission>, Option<Transition>) {
        let mut state = self.state.lock();
        let transition = self.refresh(&mut state);
        if !self.admits(&state) {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return (None, transition);
        }

        let trial = state.state == CircuitState::HalfOpen;
        if trial {
            state.half_open_in_flight += 1;
        }
        let admission = Admission {
            generation: state.generation,
            trial,
        };
        (Some(admission), transition)
    }

    /// Record a successful dispatch
    pub fn record_success(&self, admission: Admission) -> Option<Transition> {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                None
            }
            // Admitted before the circuit opened, or in an earlier cycle
            CircuitState::HalfOpen if !state.is_current_trial(admission) => None,
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                    state.half_open_in_flight = 0;
                    tracing::info!(provider = %self.provider_id, "Circuit breaker closed - provider recovered");
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            // Late completion of a call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Record a failed dispatch
    pub fn record_failure(&self, admission: Admission) -> Option<Transition> {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_successes = 0;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut state);
                    Some(Transition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if !state.is_current_trial(admission) {
                    tracing::debug!(provider = %self.provider_id, "Late failure from a non-trial call reopens the circuit");
                }
                // open() clears the in-flight trials of this cycle
                self.open(&mut state);
                Some(Transition::Opened)
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a half-open trial slot whose dispatch never reported an
    /// outcome (the caller went away)
    pub fn abandon_trial(&self, admission: Admission) {
        let mut state = self.state.lock();
        if state.is_current_trial(admission) {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn open(&self, state: &mut BreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        state.generation += 1;
        self.times_opened.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            provider = %self.provider_id,
            consecutive_failures = state.consecutive_failures,
            timeout_ms = self.config.timeout_ms,
            "Circuit breaker opened"
        );
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) -> Option<Transition> {
        let mut state = self.state.lock();
        let was = state.state;
        *state = BreakerState {
            generation: state.generation + 1,
            ..BreakerState::default()
        };
        (was != CircuitState::Closed).then_some(Transition::Closed)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            half_open_in_flight: state.half_open_in_flight,
            open_for: state
                .opened_at
                .filter(|_| state.state == CircuitState::Open)
                .map(|t| t.elapsed()),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of a breaker
#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    /// Time spent open so far, when open
    pub open_for: Option<Duration>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Circuit breakers for every provider, keyed by provider id
///
/// Transitions are published as [`RouterEvent`]s when an event bus is
/// attached. Unknown providers are treated as ineligible.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            breakers: DashMap::new(),
            events: Some(events),
        }
    }

    /// Register a provider, replacing any existing breaker
    pub fn register(&self, provider_id: impl Into<String>, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let provider_id = provider_id.into();
        let breaker = Arc::new(CircuitBreaker::new(provider_id.clone(), config));
        self.breakers.insert(provider_id, breaker.clone());
        breaker
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider_id).map(|b| b.clone())
    }

    /// Whether the provider would currently be admitted
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        let Some(breaker) = self.get(provider_id) else {
            return false;
        };
        let (eligible, transition) = breaker.is_eligible();
        self.publish(provider_id, transition);
        eligible
    }

    /// Admit one dispatch; reserves a trial slot when half-open. The
    /// admission goes back with the outcome.
    pub fn try_admit(&self, provider_id: &str) -> Option<Admission> {
        let breaker = self.get(provider_id)?;
        let (admission, transition) = breaker.try_admit();
        self.publish(provider_id, transition);
        admission
    }

    pub fn record_success(&self, provider_id: &str, admission: Admission) {
        if let Some(breaker) = self.get(provider_id) {
            let transition = breaker.record_success(admission);
            self.publish(provider_id, transition);
        }
    }

    pub fn record_failure(&self, provider_id: &str, admission: Admission) {
        if let Some(breaker) = self.get(provider_id) {
            let transition = breaker.record_failure(admission);
            self.publish(provider_id, transition);
        }
    }

    pub fn abandon_trial(&self, provider_id: &str, admission: Admission) {
        if let Some(breaker) = self.get(provider_id) {
            breaker.abandon_trial(admission);
        }
    }

    /// Manually close a provider's circuit
    pub fn reset(&self, provider_id: &str) {
        if let Some(breaker) = self.get(provider_id) {
            let transition = breaker.reset();
            if transition.is_some() {
                tracing::info!(provider = %provider_id, "Circuit breaker manually reset");
            }
            self.publish(provider_id, transition);
        }
    }

    pub fn state(&self, provider_id: &str) -> Option<CircuitState> {
        self.get(provider_id).map(|b| b.state())
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<BreakerSnapshot> {
        self.get(provider_id).map(|b| b.snapshot())
    }

    pub fn all_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn publish(&self, provider_id: &str, transition: Option<Transition>) {
        let (Some(events), Some(transition)) = (&self.events, transition) else {
            return;
        };
        let provider = provider_id.to_string();
        events.emit(match transition {
            Transition::Opened => RouterEvent::CircuitOpened { provider },
            Transition::HalfOpened => {
                tracing::info!(provider = %provider_id, "Circuit breaker transitioning to half-open");
                RouterEvent::CircuitHalfOpen { provider }
            }
            Transition::Closed => RouterEvent::CircuitClosed { provider },
        });
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, timeout_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            success_threshold: 2,
            timeout_ms,
            half_open_requests: 1,
        }
    }

    fn admit(breaker: &CircuitBreaker) -> Admission {
        breaker.try_admit().0.expect("breaker should admit")
    }

    fn fail(breaker: &CircuitBreaker) -> Option<Transition> {
        let admission = admit(breaker);
        breaker.record_failure(admission)
    }

    fn succeed(breaker: &CircuitBreaker) -> Option<Transition> {
        let admission = admit(breaker);
        breaker.record_success(admission)
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            fail(breaker);
        }
    }

    #[test]
    fn test_initial_state() {
        let breaker = CircuitBreaker::new("a", BreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_eligible().0);
        assert!(!admit(&breaker).is_trial());
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("a", config(3, 60_000));

        assert_eq!(fail(&breaker), None);
        assert_eq!(fail(&breaker), None);
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert_eq!(fail(&breaker), Some(Transition::Opened));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_eligible().0);
        assert!(breaker.try_admit().0.is_none());
        assert_eq!(breaker.snapshot().total_rejections, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("a", config(3, 60_000));

        fail(&breaker);
        fail(&breaker);
        succeed(&breaker);
        fail(&breaker);
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_after_timeout() {
        let breaker = CircuitBreaker::new("a", config(2, 10));
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(breaker.is_eligible(), (true, Some(Transition::HalfOpened)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_limited_trials() {
        let breaker = CircuitBreaker::new(
            "a",
            BreakerConfig {
                half_open_requests: 2,
                ..config(1, 10)
            },
        );
        trip(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        let first = admit(&breaker);
        assert!(first.is_trial());
        assert!(breaker.try_admit().0.is_some());
        assert!(breaker.try_admit().0.is_none());
        assert!(!breaker.is_eligible().0);

        // A completed trial frees its slot
        breaker.record_success(first);
        assert!(breaker.try_admit().0.is_some());
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let breaker = CircuitBreaker::new("a", config(1, 10));
        trip(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        let trial = admit(&breaker);
        assert!(breaker.try_admit().0.is_none());
        breaker.abandon_trial(trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_admit().0.is_some());
    }

    #[test]
    fn test_half_open_successes_close() {
        let breaker = CircuitBreaker::new("a", config(1, 10));
        trip(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(succeed(&breaker), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker), Some(Transition::Closed));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("a", config(1, 10));
        trip(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(fail(&breaker), Some(Transition::Opened));
        assert_eq!(breaker.state(), CircuitState::Open);
        // Fresh timestamp: still open immediately after
        assert!(!breaker.is_eligible().0);
        assert_eq!(breaker.snapshot().times_opened, 2);
    }

    #[test]
    fn test_late_success_from_closed_call_is_not_a_trial() {
        let breaker = CircuitBreaker::new("a", config(1, 10));

        // Admitted while closed, still running when the circuit trips
        let straggler = admit(&breaker);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(20));
        let trial = admit(&breaker);
        assert!(trial.is_trial());

        assert_eq!(breaker.record_success(straggler), None);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.half_open_in_flight, 1);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert!(breaker.try_admit().0.is_none());

        // The real trial still drives the state machine
        assert_eq!(breaker.record_success(trial), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_late_failure_from_closed_call_reopens() {
        let breaker = CircuitBreaker::new("a", config(1, 10));

        let straggler = admit(&breaker);
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(20));
        let trial = admit(&breaker);

        assert_eq!(breaker.record_failure(straggler), Some(Transition::Opened));
        // The trial belongs to the previous cycle now
        assert_eq!(breaker.record_success(trial), None);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        breaker.abandon_trial(trial);
        assert!(breaker.try_admit().0.is_some());
        assert!(breaker.try_admit().0.is_none());
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new("a", config(1, 60_000));
        trip(&breaker);

        assert_eq!(breaker.reset(), Some(Transition::Closed));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.reset(), None);
    }

    #[tokio::test]
    async fn test_registry_publishes_transitions() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let registry = CircuitBreakerRegistry::with_events(events);
        registry.register("a", config(1, 10));

        let admission = registry.try_admit("a").unwrap();
        registry.record_failure("a", admission);
        assert_eq!(registry.state("a"), Some(CircuitState::Open));

        std::thread::sleep(Duration::from_millis(20));
        for _ in 0..2 {
            let trial = registry.try_admit("a").unwrap();
            registry.record_success("a", trial);
        }

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec!["circuit_opened", "circuit_half_open", "circuit_closed"]
        );
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = CircuitBreakerRegistry::new();
        assert!(!registry.is_eligible("ghost"));
        assert!(registry.try_admit("ghost").is_none());
        assert_eq!(registry.state("ghost"), None);
        assert!(registry.is_empty());
    }
}
