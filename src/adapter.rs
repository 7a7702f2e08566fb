//! Provider adapter contract
//!
//! The core consumes every backend through this fixed interface. The five
//! vendor adapters live outside the crate; anything implementing
//! [`ProviderAdapter`] can be registered with the switchboard.

use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse, ProviderDescriptor, StreamSink};

/// Error classification an adapter must map vendor failures into
///
/// Only `RateLimited`, `Transient`, and `Unavailable` are retryable by the
/// dispatcher; the rest surface immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited(_) | AdapterError::Transient(_) | AdapterError::Unavailable(_)
        )
    }

    /// Short stable label used in events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::RateLimited(_) => "rate-limited",
            AdapterError::Transient(_) => "transient",
            AdapterError::AuthFailure(_) => "auth-failure",
            AdapterError::BadRequest(_) => "bad-request",
            AdapterError::Unavailable(_) => "unavailable",
            AdapterError::Cancelled(_) => "cancelled",
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Result of a liveness probe
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            detail: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            detail: Some(detail.into()),
        }
    }
}

/// Contract every backend adapter implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static description of the provider: name, models, capabilities.
    /// Must be pure and cheap; implementations cache the descriptor.
    fn describe(&self) -> ProviderDescriptor;

    /// Execute a request and return the complete response
    async fn execute_blocking(
        &self,
        request: &CompletionRequest,
    ) -> AdapterResult<CompletionResponse>;

    /// Execute a request, pushing fragments to `sink` as they arrive.
    /// The return value is the assembled response with aggregated usage.
    async fn execute_streaming(
        &self,
        request: &CompletionRequest,
        sink: &dyn StreamSink,
    ) -> AdapterResult<CompletionResponse>;

    /// Lightweight liveness probe
    async fn health(&self) -> HealthReport;
}
