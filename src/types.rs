//! Shared data model for request mediation
//!
//! These types flow between the dispatcher, the cache engine, the usage
//! ledger, and the provider adapters. Adapters translate them to and from
//! their vendor wire formats; the core never sees vendor framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Message roles in a chat-style prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Capabilities a provider can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Chat,
    Vision,
    Tools,
    Thinking,
    Json,
    Caching,
    Grounding,
    RealtimeData,
}

/// Completion request as consumed by a provider adapter
///
/// Carries the messages, the model id, the sampling parameters, and the
/// optional tool/grounding flags. Routing controls (explicit provider,
/// capability constraints, cancellation) live on [`DispatchRequest`] in the
/// router module and never reach the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub id: Uuid,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools_enabled: bool,
    pub grounding_enabled: bool,
    pub user: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            tools_enabled: false,
            grounding_enabled: false,
            user: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Concatenated message text, used for token estimation
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token usage reported by a provider for a completed request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub reasoning_tokens: u32,
    #[serde(default)]
    pub cached_input_tokens: u32,
    /// Billable multimodal units (images, audio seconds) when the provider
    /// reports them
    #[serde(default)]
    pub multimodal_units: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens: 0,
            cached_input_tokens: 0,
            multimodal_units: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens + self.reasoning_tokens
    }
}

/// Completion response assembled by a provider adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    /// Cost reported natively by the provider, preferred over the computed
    /// cost when present
    pub native_cost: Option<f64>,
}

/// Incremental fragment pushed to a [`StreamSink`] during streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamFragment {
    Text { content: String },
    Reasoning { content: String },
    ToolCall { name: String, arguments: String },
    Finish { reason: Option<String> },
}

/// Receiver for streaming fragments
///
/// The dispatcher wraps the caller's sink to track whether anything has
/// been delivered yet; adapters only ever see the wrapper.
pub trait StreamSink: Send + Sync {
    fn deliver(&self, fragment: StreamFragment);
}

/// Sink that forwards fragments into an unbounded tokio channel
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<StreamFragment>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<StreamFragment>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamSink for ChannelSink {
    fn deliver(&self, fragment: StreamFragment) {
        // Receiver may have been dropped; nothing to do then
        let _ = self.tx.send(fragment);
    }
}

/// Per-model pricing descriptor, USD per token (or per unit for multimodal)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
    #[serde(default)]
    pub cached_input_price: Option<f64>,
    #[serde(default)]
    pub reasoning_price: Option<f64>,
    #[serde(default)]
    pub multimodal_unit_price: Option<f64>,
}

impl ModelPricing {
    pub fn new(input_price: f64, output_price: f64) -> Self {
        Self {
            input_price,
            output_price,
            cached_input_price: None,
            reasoning_price: None,
            multimodal_unit_price: None,
        }
    }
}

/// Model offered by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub pricing: ModelPricing,
}

/// Static description of a provider, returned by `ProviderAdapter::describe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Logical provider name used in routing, events, and the ledger
    pub name: String,
    pub models: HashMap<String, ModelSpec>,
    pub capabilities: HashSet<Capability>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: HashMap::new(),
            capabilities: HashSet::new(),
        }
    }

    pub fn with_model(mut self, spec: ModelSpec) -> Self {
        self.models.insert(spec.id.clone(), spec);
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn supports(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Immutable usage row written to the ledger for every completed dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub user_id: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
    pub cached_input_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub cache_hit: bool,
}

impl UsageRow {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        user_id: Option<String>,
        usage: TokenUsage,
        cost: f64,
        latency_ms: u64,
        success: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            user_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            reasoning_tokens: usage.reasoning_tokens,
            cached_input_tokens: usage.cached_input_tokens,
            total_tokens: usage.total(),
            cost,
            latency_ms,
            success,
            cache_hit: false,
        }
    }

    /// Synthetic row for a request served from cache: no output tokens, no
    /// cost, only the observed lookup latency
    pub fn for_cache_hit(
        provider: impl Into<String>,
        model: impl Into<String>,
        user_id: Option<String>,
        estimated_input_tokens: u32,
        latency_ms: u64,
    ) -> Self {
        let mut row = Self::new(
            provider,
            model,
            user_id,
            TokenUsage::new(estimated_input_tokens, 0),
            0.0,
            latency_ms,
            true,
        );
        row.cache_hit = true;
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_total_includes_reasoning() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            reasoning_tokens: 25,
            cached_input_tokens: 40,
            multimodal_units: 0,
        };
        // Cached input tokens are a subset of input tokens, not additive
        assert_eq!(usage.total(), 175);
    }

    #[test]
    fn descriptor_capability_check() {
        let descriptor = ProviderDescriptor::new("provA")
            .with_capabilities([Capability::Chat, Capability::Tools]);
        assert!(descriptor.supports(&[Capability::Chat]));
        assert!(descriptor.supports(&[Capability::Chat, Capability::Tools]));
        assert!(!descriptor.supports(&[Capability::Vision]));
    }

    #[test]
    fn channel_sink_forwards_fragments() {
        let (sink, mut rx) = ChannelSink::new();
        sink.deliver(StreamFragment::Text {
            content: "hi".to_string(),
        });
        let fragment = tokio_test::block_on(rx.recv()).unwrap();
        assert!(matches!(fragment, StreamFragment::Text { content } if content == "hi"));
    }

    #[test]
    fn cache_hit_row_has_no_cost() {
        let row = UsageRow::for_cache_hit("provA", "m1", None, 42, 3);
        assert!(row.cache_hit);
        assert!(row.success);
        assert_eq!(row.cost, 0.0);
        assert_eq!(row.output_tokens, 0);
        assert_eq!(row.input_tokens, 42);
    }
}
