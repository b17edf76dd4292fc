//! Concurrency Limiter
//!
//! Per-provider admission control: a fixed number of in-flight slots plus a
//! bounded FIFO wait queue. A released slot is handed directly to the oldest
//! waiter, so queued requests are served strictly in arrival order.
//!
//! Waiters that give up (queue timeout, caller deadline, or the future being
//! dropped) remove themselves from the queue; a slot granted to a waiter that
//! is already gone is passed on instead of leaking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::config::LimiterConfig;

// ============================================================================
// Errors
// ============================================================================

/// Admission failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// Provider was never registered
    #[error("no limiter registered for provider {0}")]
    UnknownProvider(String),

    /// All slots busy and the wait queue is at capacity
    #[error("wait queue for {0} is full")]
    QueueFull(String),

    /// Waited `queue_timeout` without getting a slot
    #[error("timed out waiting for a slot on {0}")]
    QueueTimeout(String),

    /// The caller's deadline passed while queued
    #[error("request deadline passed while queued for {0}")]
    DeadlineExceeded(String),
}

// ============================================================================
// Provider Slots
// ============================================================================

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    in_flight: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct SlotCounters {
    acquired: AtomicU64,
    queued: AtomicU64,
    rejected_full: AtomicU64,
    timed_out: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Slots and wait queue for one provider
pub struct ProviderSlots {
    provider_id: String,
    config: LimiterConfig,
    state: Mutex<SlotState>,
    next_waiter: AtomicU64,
    counters: SlotCounters,
}

impl ProviderSlots {
    fn new(provider_id: String, config: LimiterConfig) -> Self {
        Self {
            provider_id,
            config,
            state: Mutex::new(SlotState::default()),
            next_waiter: AtomicU64::new(0),
            counters: SlotCounters::default(),
        }
    }

    /// Acquire a slot, queueing when all are busy
    ///
    /// `deadline` is the caller's overall deadline; the effective wait is the
    /// earlier of it and `queue_timeout`.
    pub async fn acquire(self: &Arc<Self>, deadline: Option<Instant>) -> Result<Permit, LimiterError> {
        let (id, mut rx) = {
            let mut state = self.state.lock();

            // Fast path: free slot and nobody ahead of us
            if state.in_flight < self.config.max_concurrent_requests && state.waiters.is_empty() {
                state.in_flight += 1;
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(Permit::new(self.clone()));
            }

            if state.waiters.len() >= self.config.queue_size {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(provider = %self.provider_id, queued = state.waiters.len(), "Wait queue full");
                return Err(LimiterError::QueueFull(self.provider_id.clone()));
            }

            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant: tx });
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            (id, rx)
        };

        // Declared after `rx` so it is dropped first: cleanup runs while the
        // receiver is still alive, which makes "not in queue" mean "granted".
        let mut guard = WaitGuard {
            slots: self,
            id,
            settled: false,
        };

        let wait_start = Instant::now();
        let queue_deadline = wait_start + self.config.queue_timeout();
        let (limit, caller_deadline) = match deadline {
            Some(d) if d < queue_deadline => (d, true),
            _ => (queue_deadline, false),
        };

        let outcome = tokio::time::timeout_at(limit, &mut rx).await;
        self.counters
            .total_wait_ms
            .fetch_add(wait_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {
                guard.settled = true;
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(Permit::new(self.clone()))
            }
            Ok(Err(_)) | Err(_) => {
                drop(guard);
                if caller_deadline {
                    Err(LimiterError::DeadlineExceeded(self.provider_id.clone()))
                } else {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(provider = %self.provider_id, "Timed out in wait queue");
                    Err(LimiterError::QueueTimeout(self.provider_id.clone()))
                }
            }
        }
    }

    /// Free a slot, handing it to the oldest live waiter
    fn release(&self) {
        let mut state = self.state.lock();
        Self::release_locked(&mut state);
    }

    fn release_locked(state: &mut SlotState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Whether a new request would get a slot or a queue position
    pub fn has_capacity(&self) -> bool {
        let state = self.state.lock();
        state.in_flight < self.config.max_concurrent_requests
            || state.waiters.len() < self.config.queue_size
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn stats(&self) -> LimiterStats {
        let (in_flight, queued) = {
            let state = self.state.lock();
            (state.in_flight, state.waiters.len())
        };
        let acquired = self.counters.acquired.load(Ordering::Relaxed);
        let waited = self.counters.queued.load(Ordering::Relaxed);
        LimiterStats {
            provider_id: self.provider_id.clone(),
            max_concurrent: self.config.max_concurrent_requests,
            queue_size: self.config.queue_size,
            in_flight,
            queued,
            total_acquired: acquired,
            total_queued: waited,
            rejected_queue_full: self.counters.rejected_full.load(Ordering::Relaxed),
            queue_timeouts: self.counters.timed_out.load(Ordering::Relaxed),
            avg_wait_ms: if waited > 0 {
                self.counters.total_wait_ms.load(Ordering::Relaxed) / waited
            } else {
                0
            },
        }
    }
}

/// Cleans up a waiter that did not receive its slot normally
struct WaitGuard<'a> {
    slots: &'a ProviderSlots,
    id: u64,
    settled: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.slots.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
        } else {
            // Granted concurrently with giving up; pass the slot on
            ProviderSlots::release_locked(&mut state);
        }
    }
}

/// An acquired slot, released on drop
pub struct Permit {
    slots: Arc<ProviderSlots>,
}

impl Permit {
    fn new(slots: Arc<ProviderSlots>) -> Self {
        Self { slots }
    }

    pub fn provider_id(&self) -> &str {
        &self.slots.provider_id
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.slots.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("provider_id", &self.slots.provider_id)
            .finish()
    }
}

/// Limiter statistics for one provider
#[derive(Clone, Debug, Serialize)]
pub struct LimiterStats {
    pub provider_id: String,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub total_acquired: u64,
    pub total_queued: u64,
    pub rejected_queue_full: u64,
    pub queue_timeouts: u64,
    pub avg_wait_ms: u64,
}

// ============================================================================
// Concurrency Limiter
// ============================================================================

/// Per-provider admission control
#[derive(Default)]
pub struct ConcurrencyLimiter {
    providers: DashMap<String, Arc<ProviderSlots>>,
}

impl ConcurrencyLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_id: impl Into<String>, config: LimiterConfig) {
        let provider_id = provider_id.into();
        self.providers.insert(
            provider_id.clone(),
            Arc::new(ProviderSlots::new(provider_id, config)),
        );
    }

    fn slots(&self, provider_id: &str) -> Result<Arc<ProviderSlots>, LimiterError> {
        self.providers
            .get(provider_id)
            .map(|s| s.clone())
            .ok_or_else(|| LimiterError::UnknownProvider(provider_id.to_string()))
    }

    /// Acquire a slot on `provider_id`
    pub async fn acquire(&self, provider_id: &str, deadline: Option<Instant>) -> Result<Permit, LimiterError> {
        let slots = self.slots(provider_id)?;
        slots.acquire(deadline).await
    }

    /// Acquire without waiting
    pub fn try_acquire(&self, provider_id: &str) -> Result<Permit, LimiterError> {
        let slots = self.slots(provider_id)?;
        let mut state = slots.state.lock();
        if state.in_flight < slots.config.max_concurrent_requests && state.waiters.is_empty() {
            state.in_flight += 1;
            slots.counters.acquired.fetch_add(1, Ordering::Relaxed);
            drop(state);
            Ok(Permit::new(slots.clone()))
        } else {
            Err(LimiterError::QueueFull(provider_id.to_string()))
        }
    }

    /// Release a slot back to its provider
    #[allow(clippy::needless_pass_by_value)]
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub fn has_capacity(&self, provider_id: &str) -> bool {
        self.slots(provider_id).is_ok_and(|s| s.has_capacity())
    }

    pub fn in_flight(&self, provider_id: &str) -> usize {
        self.slots(provider_id).map_or(0, |s| s.in_flight())
    }

    pub fn queued(&self, provider_id: &str) -> usize {
        self.slots(provider_id).map_or(0, |s| s.queued())
    }

    pub fn stats(&self, provider_id: &str) -> Option<LimiterStats> {
        self.slots(provider_id).ok().map(|s| s.stats())
    }
}

// ============================================================================
// Tests
// ============================================================================
