//! Request and response types shared by the router and provider adapters

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role of a message author
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in the request payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Generation options forwarded to the provider
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Capability flags, used both to describe providers and to express
/// request requirements
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub vision: bool,
    pub streaming: bool,
}

impl Capabilities {
    /// True when every capability in `required` is present in `self`
    #[must_use]
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        (!required.vision || self.vision) && (!required.streaming || self.streaming)
    }

    /// Names of required capabilities missing from `self`
    #[must_use]
    pub fn missing(&self, required: &Capabilities) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if required.vision && !self.vision {
            missing.push("vision");
        }
        if required.streaming && !self.streaming {
            missing.push("streaming");
        }
        missing
    }
}

/// A logical completion request, immutable once submitted
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    /// Unique request identifier
    pub request_id: String,
    /// Conversation payload
    pub messages: Vec<Message>,
    /// Generation options
    pub options: GenerationOptions,
    /// Explicit provider override
    pub provider: Option<String>,
    /// Explicit model override
    pub model: Option<String>,
    /// Caller-supplied input token estimate
    pub estimated_tokens: Option<u64>,
    /// Capabilities the chosen provider must have
    pub requires: Capabilities,
    /// Caller identity for per-caller budgets
    pub caller: Option<String>,
    /// Overall deadline for the request (router default when unset)
    pub timeout: Option<Duration>,
    /// Bypass cache lookup and population
    pub skip_cache: bool,
}

impl CompletionRequest {
    /// Create a request from a message list
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            messages,
            options: GenerationOptions::default(),
            provider: None,
            model: None,
            estimated_tokens: None,
            requires: Capabilities::default(),
            caller: None,
            timeout: None,
            skip_cache: false,
        }
    }

    /// Create a single-turn user request
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.requires.vision = true;
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.requires.streaming = true;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// Flatten the payload into a single prompt string
    #[must_use]
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Input token estimate: the caller's figure, or roughly four characters
    /// per token
    #[must_use]
    pub fn estimated_input_tokens(&self) -> u64 {
        self.estimated_tokens.unwrap_or_else(|| {
            let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
            (chars as u64).div_ceil(4).max(1)
        })
    }
}

/// Token counts by kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
    pub thinking: u64,
}

impl TokenCounts {
    #[must_use]
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cached + self.thinking
    }

    pub fn add(&mut self, other: &TokenCounts) {
        self.input += other.input;
        self.output += other.output;
        self.cached += other.cached;
        self.thinking += other.thinking;
    }
}

/// Completed response from a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text
    pub content: String,
    /// Model that produced the response
    pub model: String,
    /// Token usage reported by the provider
    #[serde(default)]
    pub usage: TokenCounts,
    /// Provider-reported stop reason
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>, usage: TokenCounts) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage,
            finish_reason: None,
        }
    }
}

/// Chunks delivered to streaming callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamChunk {
    /// Incremental text
    Delta(String),
    /// A failed attempt already streamed text; discard it, a new attempt
    /// on `provider` follows
    Restart { provider: String },
}
