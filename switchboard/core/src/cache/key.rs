//! Cache key derivation

use std::fmt;

use sha2::{Digest, Sha256};

use crate::provider::CompletionRequest;

/// Canonical prompt form: trimmed, whitespace collapsed, lowercased
#[must_use]
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Temperature at the precision it is keyed on
#[must_use]
pub fn temperature_token(temperature: f32) -> String {
    format!("{temperature:.4}")
}

/// Hex SHA-256 over the normalized prompt and generation parameters
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn generate(prompt: &str, provider: &str, model: &str, temperature: f32, max_tokens: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_prompt(prompt).as_bytes());
        hasher.update([0u8]);
        hasher.update(provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(temperature_token(temperature).as_bytes());
        hasher.update([0u8]);
        hasher.update(max_tokens.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Key for `request` served by (provider, model)
    #[must_use]
    pub fn for_request(request: &CompletionRequest, provider: &str, model: &str) -> Self {
        Self::generate(
            &request.prompt_text(),
            provider,
            model,
            request.options.temperature,
            request.options.max_tokens,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
