//! Shared fixtures for router integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use switchboard_core::provider::{
    CompletionRequest, CompletionResponse, ProviderAdapter, ProviderError, TokenCounts,
};
use switchboard_core::routing::{ProviderConfig, RetryConfig};
use switchboard_core::{ModelPricing, RequestRouter, RouterConfig};

/// Scripted outcome for one call
#[derive(Clone, Debug)]
pub enum Reply {
    Ok,
    Fail(ProviderError),
    Slow(Duration),
}

/// Provider that plays a script, then keeps answering with `fallback`
pub struct FakeProvider {
    id: String,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    usage: TokenCounts,
}

impl FakeProvider {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_script(id, Vec::new(), Reply::Ok)
    }

    pub fn failing(id: &str, error: ProviderError) -> Arc<Self> {
        Self::with_script(id, Vec::new(), Reply::Fail(error))
    }

    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Self::with_script(id, Vec::new(), Reply::Slow(delay))
    }

    pub fn with_script(id: &str, script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            usage: TokenCounts::new(10, 10),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, model: &str, _request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Ok => {}
            Reply::Fail(error) => return Err(error),
            Reply::Slow(delay) => tokio::time::sleep(delay).await,
        }
        Ok(CompletionResponse::new(format!("answer from {}", self.id), model, self.usage))
    }
}

/// Provider `id` with one model at a flat per-token price and no retries
pub fn provider(id: &str, price: f64) -> ProviderConfig {
    ProviderConfig::new(id, format!("{id}-model"), ModelPricing::flat(price)).with_retry(RetryConfig {
        max_retries: 0,
        ..Default::default()
    })
}

/// Config without background tasks, so tests drive time themselves
pub fn quiet_config(providers: Vec<ProviderConfig>) -> RouterConfig {
    let mut config = RouterConfig::new(providers).with_health_check_interval(Duration::ZERO);
    config.cache.cleanup_interval_secs = 0;
    config
}

pub fn start(config: RouterConfig, adapters: &[Arc<FakeProvider>]) -> RequestRouter {
    let router = adapters
        .iter()
        .fold(RequestRouter::builder(config), |builder, adapter| builder.provider(adapter.clone()))
        .build()
        .expect("router should build");
    router.start().expect("router should start");
    router
}

/// Request costing exactly `(10 + 10) * price` to estimate
pub fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest::from_prompt(prompt)
        .with_estimated_tokens(10)
        .with_max_tokens(10)
}
