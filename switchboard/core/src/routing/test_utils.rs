//! Scripted provider adapters for router tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::provider::{CompletionRequest, CompletionResponse, ProviderAdapter, ProviderError, TokenCounts};

/// One scripted call outcome
#[derive(Clone, Debug)]
pub enum Step {
    /// Fail with the given error
    Fail(ProviderError),
    /// Sleep, then answer normally
    Delay(Duration),
    /// Stream the given deltas, then fail
    StreamThenFail(Vec<String>),
}

/// Adapter that plays back scripted steps, then answers successfully
pub struct MockAdapter {
    id: String,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    healthy: AtomicBool,
    usage: TokenCounts,
}

impl MockAdapter {
    pub fn scripted(id: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            usage: TokenCounts::new(10, 10),
        })
    }

    pub fn always_ok(id: &str) -> Arc<Self> {
        Self::scripted(id, Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn response(&self, model: &str) -> CompletionResponse {
        CompletionResponse::new(format!("{} says hi", self.id), model, self.usage)
    }

    async fn play(&self, model: &str, chunks: Option<&mpsc::Sender<String>>) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.response(model))
            }
            Some(Step::StreamThenFail(deltas)) => {
                if let Some(chunks) = chunks {
                    for delta in deltas {
                        let _ = chunks.send(delta).await;
                    }
                }
                Err(ProviderError::Other("stream interrupted".into()))
            }
            None => {
                let response = self.response(model);
                if let Some(chunks) = chunks {
                    let _ = chunks.send(response.content.clone()).await;
                }
                Ok(response)
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, model: &str, _request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.play(model, None).await
    }

    async fn complete_streaming(
        &self,
        model: &str,
        _request: &CompletionRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        self.play(model, Some(&chunks)).await
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
