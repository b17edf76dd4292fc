//! Retry Policy
//!
//! Decides whether a failed attempt on a provider is retried on the same
//! provider and how long to back off first. Failover across providers is the
//! router's job.

use std::time::Duration;

use super::config::RetryConfig;
use crate::provider::ProviderError;

/// Outcome of a retry decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try the same provider again
    RetryAfter(Duration),
    /// Stop retrying this provider
    GiveUp,
}

/// Exponential backoff over transient failures
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempts including the first one
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Delay before retry `retry` (0-indexed):
    /// `min(max_delay, initial_delay * multiplier^retry)`
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let max = self.config.max_delay_ms as f64;
        let capped = base.min(max);

        let duration_ms = if self.config.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)).min(max)
        } else {
            capped
        };

        Duration::from_millis(duration_ms as u64)
    }

    /// Decide what to do after `error` when `retries_done` retries have
    /// already been made
    #[must_use]
    pub fn decide(&self, error: &ProviderError, retries_done: u32) -> RetryDecision {
        if !error.is_transient() || retries_done >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.delay_for_retry(retries_done);
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint).min(Duration::from_millis(self.config.max_delay_ms));
        }
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        })
    }

    #[test]
    fn test_backoff_progression() {
        let policy = policy();
        let delays: Vec<u64> = (0..5)
            .map(|n| policy.delay_for_retry(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let jittered = RetryPolicy::new(RetryConfig {
            use_jitter: true,
            ..policy().config().clone()
        });
        for n in 0..8 {
            let delay = jittered.delay_for_retry(n);
            assert!(delay <= Duration::from_millis(1000));
            assert!(delay >= policy().delay_for_retry(n));
        }
    }

    #[test]
    fn test_transient_errors_retry() {
        let policy = policy();
        assert_eq!(
            policy.decide(&ProviderError::Timeout, 0),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(&ProviderError::Network("reset".into()), 2),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let policy = policy();
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.decide(&ProviderError::Timeout, 5), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_transient_errors_never_retry() {
        let policy = policy();
        assert_eq!(
            policy.decide(&ProviderError::InvalidRequest("bad".into()), 0),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(
                &ProviderError::Server {
                    status: 403,
                    message: "forbidden".into()
                },
                0
            ),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_rate_limit_hint_respected_and_capped() {
        let policy = policy();
        let short_hint = ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(300)),
        };
        let long_hint = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };

        assert_eq!(
            policy.decide(&short_hint, 0),
            RetryDecision::RetryAfter(Duration::from_millis(300))
        );
        assert_eq!(
            policy.decide(&long_hint, 0),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
    }
}
