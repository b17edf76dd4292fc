//! Token pricing

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::provider::{CompletionRequest, TokenCounts};

/// Price per token, by token kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cached: f64,
    pub thinking: f64,
}

impl ModelPricing {
    /// Same price for input and output, nothing for cached or thinking
    #[must_use]
    pub fn flat(per_token: f64) -> Self {
        Self {
            input: per_token,
            output: per_token,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn cost(&self, tokens: &TokenCounts) -> f64 {
        tokens.input as f64 * self.input
            + tokens.output as f64 * self.output
            + tokens.cached as f64 * self.cached
            + tokens.thinking as f64 * self.thinking
    }

    /// All prices finite and non-negative
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.input, self.output, self.cached, self.thinking]
            .iter()
            .all(|p| p.is_finite() && *p >= 0.0)
    }
}

/// Prices keyed by (provider, model)
#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    prices: HashMap<(String, String), ModelPricing>,
}

impl PricingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: impl Into<String>, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.insert((provider.into(), model.into()), pricing);
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        self.prices.get(&(provider.to_string(), model.to_string()))
    }

    /// Cost of `tokens` on (provider, model); unknown pairs cost nothing
    #[must_use]
    pub fn cost(&self, provider: &str, model: &str, tokens: &TokenCounts) -> f64 {
        self.get(provider, model).map_or(0.0, |p| p.cost(tokens))
    }

    /// Pre-dispatch estimate: estimated input tokens plus `max_tokens` of output
    #[must_use]
    pub fn estimate(&self, provider: &str, model: &str, request: &CompletionRequest) -> f64 {
        let tokens = TokenCounts::new(
            request.estimated_input_tokens(),
            u64::from(request.options.max_tokens),
        );
        self.cost(provider, model, &tokens)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
