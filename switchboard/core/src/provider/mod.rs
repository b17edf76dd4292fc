//! Provider abstraction
//!
//! Types exchanged with backend providers and the [`ProviderAdapter`] trait
//! the router dispatches through.

mod traits;
mod types;

pub use traits::{FailureClass, ProviderAdapter, ProviderError};
pub use types::{
    Capabilities, CompletionRequest, CompletionResponse, GenerationOptions, Message, Role,
    StreamChunk, TokenCounts,
};
