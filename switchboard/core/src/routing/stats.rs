//! Rolling per-provider statistics used by the selection strategies

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::metrics::Histogram;

/// Default number of samples kept in each rolling window
pub const DEFAULT_STATS_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct Window {
    latencies_ms: VecDeque<u64>,
    outcomes: VecDeque<bool>,
}

/// Rolling latency and success-rate window for one provider
#[derive(Debug)]
pub struct ProviderStats {
    capacity: usize,
    window: Mutex<Window>,
    latency: Histogram,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl ProviderStats {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(Window::default()),
            latency: Histogram::latency_default(),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency_ms);

        let mut window = self.window.lock();
        push_bounded(&mut window.latencies_ms, latency_ms, self.capacity);
        push_bounded(&mut window.outcomes, true, self.capacity);
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut window = self.window.lock();
        push_bounded(&mut window.outcomes, false, self.capacity);
    }

    /// Mean latency over the window; 0 when no samples exist yet
    pub fn avg_latency_ms(&self) -> f64 {
        let window = self.window.lock();
        if window.latencies_ms.is_empty() {
            return 0.0;
        }
        window.latencies_ms.iter().sum::<u64>() as f64 / window.latencies_ms.len() as f64
    }

    /// Median latency over the window; 0 when no samples exist yet
    pub fn p50_latency_ms(&self) -> f64 {
        let mut samples: Vec<u64> = self.window.lock().latencies_ms.iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_unstable();
        let mid = samples.len() / 2;
        if samples.len() % 2 == 0 {
            (samples[mid - 1] + samples[mid]) as f64 / 2.0
        } else {
            samples[mid] as f64
        }
    }

    /// Success rate over the window; 1.0 when no outcomes exist yet
    pub fn success_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.outcomes.is_empty() {
            return 1.0;
        }
        let successes = window.outcomes.iter().filter(|&&ok| ok).count();
        successes as f64 / window.outcomes.len() as f64
    }

    pub fn snapshot(&self) -> ProviderStatsSnapshot {
        let histogram = self.latency.snapshot();
        ProviderStatsSnapshot {
            avg_latency_ms: self.avg_latency_ms(),
            p50_latency_ms: self.p50_latency_ms(),
            p90_latency_ms: histogram.p90(),
            p99_latency_ms: histogram.p99(),
            success_rate: self.success_rate(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, capacity: usize) {
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Point-in-time view of a provider's statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProviderStatsSnapshot {
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    /// Histogram bucket bound, all-time
    pub p90_latency_ms: f64,
    /// Histogram bucket bound, all-time
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}
