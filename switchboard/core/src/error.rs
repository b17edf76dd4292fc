//! Router error taxonomy

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::{BudgetScope, BudgetViolation};

/// Errors surfaced by [`RequestRouter`](crate::routing::RequestRouter)
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider '{provider}' rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("request queue full for provider '{provider}'")]
    QueueFull { provider: String },

    #[error("timed out waiting in queue for provider '{provider}'")]
    QueueTimeout { provider: String },

    #[error("{scope} budget exceeded: spent {spent:.4} + estimate {estimate:.4} > ceiling {ceiling:.4}")]
    BudgetExceeded {
        scope: BudgetScope,
        spent: f64,
        estimate: f64,
        ceiling: f64,
    },

    #[error("all providers exhausted (attempted: {})", attempted.join(", "))]
    AllProvidersExhausted {
        attempted: Vec<String>,
        last_error: Option<String>,
    },

    #[error("router is not running")]
    NotRunning,

    #[error("router is already running")]
    AlreadyRunning,

    #[error("unknown routing strategy: {0}")]
    UnknownStrategy(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RouterError {
    /// Admission failures that make a routed request try another provider
    #[must_use]
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::QueueTimeout { .. })
    }
}

impl From<BudgetViolation> for RouterError {
    fn from(v: BudgetViolation) -> Self {
        Self::BudgetExceeded {
            scope: v.scope,
            spent: v.spent,
            estimate: v.estimate,
            ceiling: v.ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RouterError::AllProvidersExhausted {
            attempted: vec!["a".into(), "b".into()],
            last_error: Some("timeout".into()),
        };
        assert_eq!(err.to_string(), "all providers exhausted (attempted: a, b)");

        let err: RouterError = BudgetViolation {
            scope: BudgetScope::Daily,
            spent: 9.0,
            estimate: 3.0,
            ceiling: 10.0,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "daily budget exceeded: spent 9.0000 + estimate 3.0000 > ceiling 10.0000"
        );
    }

    #[test]
    fn test_admission_failures() {
        assert!(RouterError::QueueFull { provider: "a".into() }.is_admission_failure());
        assert!(!RouterError::NotRunning.is_admission_failure());
    }
}
