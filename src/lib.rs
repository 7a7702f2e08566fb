//! # Switchboard
//!
//! LLM request mediation: a single core that sits between application code
//! and several remote model backends. For every dispatch it picks a
//! backend, enforces health and overload policy, deduplicates work through
//! a multi-tier response cache, and accounts every token and dollar in a
//! durable ledger with budget enforcement.
//!
//! ## Core pieces
//!
//! - [`adapter::ProviderAdapter`]: the fixed contract each backend adapter
//!   implements; the vendor adapters themselves live outside this crate
//! - [`cache::CacheEngine`]: memory LRU → durable SQLite → optional Redis,
//!   with an optional semantic-similarity fallback
//! - [`ledger::UsageLedger`]: append-only usage rows, aggregated views,
//!   budgets with warning/exceeded alerting
//! - [`router::Switchboard`]: strategy-driven selection, circuit breaking,
//!   concurrency limiting, failover with exponential backoff
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard::{
//!     ChatMessage, CompletionRequest, DispatchRequest, Switchboard, SwitchboardConfig,
//!     TracingSink,
//! };
//!
//! # async fn example(adapters: Vec<Arc<dyn switchboard::ProviderAdapter>>) -> anyhow::Result<()> {
//! let core = Switchboard::new(
//!     SwitchboardConfig::default(),
//!     adapters,
//!     Arc::new(TracingSink),
//! )
//! .await?;
//!
//! let request = DispatchRequest::new(
//!     CompletionRequest::new("m1", vec![ChatMessage::user("hello")]).with_temperature(0.7),
//! );
//! let outcome = core.dispatch(request).await?;
//! println!("{} answered: {}", outcome.provider, outcome.response.content);
//!
//! core.close().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod events;
pub mod ledger;
pub mod router;
pub mod types;

// Flat re-exports of the types most integrations touch
pub use adapter::{AdapterError, AdapterResult, HealthReport, ProviderAdapter};
pub use cache::{
    fingerprint::PromptKey, similarity::SimilarityAlgorithm, CacheEngine, CacheHit, CacheStats,
    CacheTier,
};
pub use config::{RoutingStrategy, SwitchboardConfig};
pub use events::{BroadcastSink, EventKind, EventSink, NullSink, SwitchboardEvent, TracingSink};
pub use ledger::{
    budget::{BudgetScope, BudgetStatusView},
    pricing::{compute_cost, estimate_cost, estimate_tokens},
    ProviderComparison, UsageLedger, UsageSummary,
};
pub use router::{
    breaker::CircuitState, DispatchError, DispatchOutcome, DispatchRequest, ProviderStatus,
    Switchboard,
};
pub use types::{
    Capability, ChannelSink, ChatMessage, CompletionRequest, CompletionResponse, MessageRole,
    ModelPricing, ModelSpec, ProviderDescriptor, StreamFragment, StreamSink, TokenUsage, UsageRow,
};

use thiserror::Error;

/// Construction errors for the mediation core
#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("cache initialization failed: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("ledger initialization failed: {0}")]
    Ledger(#[from] ledger::LedgerError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for switchboard operations
pub type Result<T> = std::result::Result<T, SwitchboardError>;
