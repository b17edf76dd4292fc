//! Router Metrics
//!
//! Lock-free counters and latency histograms for the routing engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds, in milliseconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets in milliseconds
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    pub fn record(&self, value_ms: u64) {
        let value = value_ms as f64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(bucket_idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.min.fetch_min(value_ms, Ordering::Relaxed);
        self.max.fetch_max(value_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket containing the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Request-level counters for the router
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub requests: Counter,
    pub successes: Counter,
    pub failures: Counter,
    pub failovers: Counter,
    pub retries: Counter,
    pub timeouts: Counter,
    pub budget_rejections: Counter,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            requests: self.requests.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            failovers: self.failovers.get(),
            retries: self.retries.get(),
            timeouts: self.timeouts.get(),
            budget_rejections: self.budget_rejections.get(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouterMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failovers: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub budget_rejections: u64,
}

impl RouterMetricsSnapshot {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            1.0
        } else {
            self.successes as f64 / completed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::latency_default();
        for _ in 0..90 {
            histogram.record(20);
        }
        for _ in 0..10 {
            histogram.record(900);
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.total, 100);
        assert_eq!(snapshot.min, 20);
        assert_eq!(snapshot.max, 900);
        assert!((snapshot.p50() - 25.0).abs() < f64::EPSILON);
        assert!((snapshot.p90() - 25.0).abs() < f64::EPSILON);
        assert!((snapshot.p99() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_histogram() {
        let snapshot = Histogram::latency_default().snapshot();
        assert_eq!(snapshot.min, 0);
        assert!(snapshot.p50().abs() < f64::EPSILON);
    }

    #[test]
    fn test_router_metrics_success_rate() {
        let metrics = RouterMetrics::new();
        metrics.successes.add(3);
        metrics.failures.inc();
        assert!((metrics.snapshot().success_rate() - 0.75).abs() < f64::EPSILON);
    }
}
