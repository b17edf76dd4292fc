//! Switchboard Core - Multi-Provider Completion Routing
//!
//! Routes completion requests across interchangeable AI providers. Each
//! request is served from cache when possible, otherwise sent to the
//! provider the active strategy picks, with circuit breaking, queueing,
//! retries, failover and spend budgets applied on the way.
//!
//! # Key Types
//!
//! - [`RequestRouter`]: the routing engine and its start/stop lifecycle
//! - [`ProviderAdapter`]: the seam a concrete provider client implements
//! - [`CacheEngine`]: memory, SQLite and pluggable distributed cache layers
//! - [`TokenTracker`]: pricing, usage ledger and budgets
//! - [`RouterEvent`]: everything observable about routing, on a bounded bus
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_core::{config, CompletionRequest, RequestRouter};
//!
//! let config = config::load_config()?;
//! let router = RequestRouter::builder(config)
//!     .provider(Arc::new(MyOpenAiAdapter::new()))
//!     .build()?;
//! router.start()?;
//!
//! let routed = router.submit(CompletionRequest::from_prompt("Hello")).await?;
//! println!("{} via {}", routed.response.content, routed.provider);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod provider;
pub mod routing;

pub use cache::{CacheConfig, CacheEngine, CacheLayer, CacheLookup, CacheStats};
pub use config::{ConfigError, ConfigSource, RouterConfig};
pub use error::RouterError;
pub use events::{CacheHitKind, EventBus, RouterEvent};
pub use ledger::{BudgetConfig, BudgetMode, ModelPricing, TokenTracker, UsageStats};
pub use provider::{
    Capabilities, CompletionRequest, CompletionResponse, Message, ProviderAdapter, ProviderError, Role,
    StreamChunk, TokenCounts,
};
pub use routing::{ProviderConfig, RequestRouter, RoutedResponse, RouterStats, StrategyKind};
