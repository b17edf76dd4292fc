//! Provider Adapter Trait
//!
//! The router treats every backend as an opaque adapter. Implementations own
//! the wire protocol (HTTP APIs, local runtimes, ...) and report failures as
//! [`ProviderError`] so the router can classify them for retry and failover.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{CompletionRequest, CompletionResponse};

/// Failure reported by a provider adapter
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    /// The provider did not answer in time
    #[error("provider timed out")]
    Timeout,

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Provider returned an error status
    #[error("provider returned status {status}: {message}")]
    Server { status: u16, message: String },

    /// Provider throttled the request
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    /// The request itself is malformed; no provider will accept it
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other provider fault (auth, malformed response, ...)
    #[error("{0}")]
    Other(String),
}

/// How the router reacts to a [`ProviderError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry on the same provider
    Transient,
    /// Do not retry, but another provider may succeed
    Provider,
    /// Surface to the caller immediately
    Invalid,
}

impl ProviderError {
    /// Classify the failure for retry and failover decisions
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::Network(_) | Self::RateLimited { .. } => FailureClass::Transient,
            Self::Server { status, .. } if *status >= 500 || *status == 408 || *status == 429 => {
                FailureClass::Transient
            }
            Self::Server { .. } | Self::Other(_) => FailureClass::Provider,
            Self::InvalidRequest(_) => FailureClass::Invalid,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Retry-after hint, when the provider sent one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A backend the router can dispatch to
///
/// Implement this trait to plug a provider into the router. The router owns
/// retries, timeouts and failover; adapters should make a single attempt.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier, matching the `id` in configuration
    fn id(&self) -> &str;

    /// Send a request and wait for the complete response
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Send a request and stream text deltas through `chunks`
    ///
    /// Returns the complete response once the stream ends. The default
    /// implementation calls [`complete`](Self::complete) and emits the whole
    /// content as one delta.
    async fn complete_streaming(
        &self,
        model: &str,
        request: &CompletionRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(model, request).await?;
        let _ = chunks.send(response.content.clone()).await;
        Ok(response)
    }

    /// Provider-specific cost estimate; `None` defers to the ledger's
    /// pricing table
    fn estimate_cost(&self, _model: &str, _request: &CompletionRequest) -> Option<f64> {
        None
    }

    /// Check if the provider is reachable
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(ProviderError::Timeout.class(), FailureClass::Transient);
        assert_eq!(
            ProviderError::Network("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            ProviderError::Server {
                status: 503,
                message: "busy".into()
            }
            .class(),
            FailureClass::Transient
        );
        assert_eq!(
            ProviderError::Server {
                status: 401,
                message: "bad key".into()
            }
            .class(),
            FailureClass::Provider
        );
        assert_eq!(
            ProviderError::InvalidRequest("empty".into()).class(),
            FailureClass::Invalid
        );
        assert_eq!(
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
            .retry_after(),
            Some(Duration::from_secs(2))
        );
    }
}
