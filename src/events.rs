//! Structured event stream
//!
//! Every observable transition in the mediation core is emitted as a typed
//! event through a single [`EventSink`] injected at construction. Transports
//! are pluggable: log the events, fan them out over a broadcast channel, or
//! forward them to an external collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheTier;
use crate::config::RoutingStrategy;
use crate::ledger::budget::BudgetScope;

/// Enumerated event kinds with their payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "routing:selected")]
    RoutingSelected {
        provider: String,
        model: String,
        strategy: RoutingStrategy,
        attempt_plan: Vec<String>,
    },

    #[serde(rename = "circuit:open")]
    CircuitOpen {
        provider: String,
        consecutive_failures: u32,
    },

    #[serde(rename = "circuit:half-open")]
    CircuitHalfOpen { provider: String },

    #[serde(rename = "circuit:closed")]
    CircuitClosed { provider: String },

    #[serde(rename = "failover:attempt")]
    FailoverAttempt {
        from: String,
        to: String,
        attempt: u32,
    },

    #[serde(rename = "cache:hit")]
    CacheHit { key: String, tier: CacheTier },

    #[serde(rename = "cache:miss")]
    CacheMiss { key: String },

    #[serde(rename = "cache:semantic-hit")]
    CacheSemanticHit { key: String, similarity: f64 },

    #[serde(rename = "cache:error")]
    CacheFault { detail: String },

    #[serde(rename = "budget:warning")]
    BudgetWarning {
        scope: BudgetScope,
        used: f64,
        limit: f64,
    },

    #[serde(rename = "budget:exceeded")]
    BudgetExceeded {
        scope: BudgetScope,
        used: f64,
        limit: f64,
    },

    #[serde(rename = "ledger:error")]
    LedgerFault { detail: String },
}

impl EventKind {
    /// Stable name of the event kind, as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RoutingSelected { .. } => "routing:selected",
            EventKind::CircuitOpen { .. } => "circuit:open",
            EventKind::CircuitHalfOpen { .. } => "circuit:half-open",
            EventKind::CircuitClosed { .. } => "circuit:closed",
            EventKind::FailoverAttempt { .. } => "failover:attempt",
            EventKind::CacheHit { .. } => "cache:hit",
            EventKind::CacheMiss { .. } => "cache:miss",
            EventKind::CacheSemanticHit { .. } => "cache:semantic-hit",
            EventKind::CacheFault { .. } => "cache:error",
            EventKind::BudgetWarning { .. } => "budget:warning",
            EventKind::BudgetExceeded { .. } => "budget:exceeded",
            EventKind::LedgerFault { .. } => "ledger:error",
        }
    }
}

/// A single emitted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SwitchboardEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Sink for mediation events
///
/// Implementations must be non-blocking; the dispatcher emits on the
/// request path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SwitchboardEvent);
}

/// Sink that logs every event at debug level
#[derive(Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SwitchboardEvent) {
        debug!(
            event = event.kind.name(),
            payload = %serde_json::to_string(&event).unwrap_or_default(),
            "switchboard event"
        );
    }
}

/// Sink that fans events out over a broadcast channel
///
/// Subscribers that fall behind lose the oldest events; emission never
/// blocks and never fails the request path.
pub struct BroadcastSink {
    sender: broadcast::Sender<SwitchboardEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchboardEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SwitchboardEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

/// Sink that drops everything
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SwitchboardEvent) {}
}
