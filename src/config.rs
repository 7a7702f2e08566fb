//! Switchboard configuration
//!
//! A single configuration object covers routing strategy, per-provider
//! settings, circuit breaking, retry/backoff, all cache tiers, the ledger
//! with its budgets, and health checking. Every field has a default so a
//! bare `SwitchboardConfig::default()` is a working in-memory setup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cache::similarity::SimilarityAlgorithm;

/// Strategy used to order eligible providers for a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    CostBased,
    LatencyBased,
    QualityBased,
    RoundRobin,
    Weighted,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::CostBased
    }
}

/// Per-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    /// Relative weight for the `weighted` strategy
    pub weight: f64,
    /// In-flight request ceiling enforced by the load limiter
    pub max_concurrent: u32,
    /// Per-attempt timeout; expiry is treated as a transient failure
    pub timeout_ms: u64,
    /// Opaque adapter-specific configuration, passed through untouched
    pub adapter_config: serde_json::Value,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
            max_concurrent: 10,
            timeout_ms: 30_000,
            adapter_config: serde_json::Value::Null,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time the circuit stays open before probing
    pub open_timeout_ms: u64,
    /// Concurrent probe cap while half-open
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            half_open_probes: 3,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Retry and backoff settings for the failover loop
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Backoff before attempt `attempt` (1-based): min(initial × mult^(n−1), max)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Memory tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheSettings {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for MemoryCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl_ms: 3_600_000, // 1 hour
        }
    }
}

/// Durable tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableCacheSettings {
    pub enabled: bool,
    pub path: String,
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for DurableCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "switchboard_cache.db".to_string(),
            max_entries: 10_000,
            ttl_ms: 7 * 24 * 3_600_000, // 7 days
        }
    }
}

/// Distributed tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedCacheSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub ttl_ms: u64,
}

impl Default for DistributedCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "redis://127.0.0.1:6379".to_string(),
            ttl_ms: 14 * 24 * 3_600_000, // 14 days
        }
    }
}

/// Semantic-similarity fallback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilaritySettings {
    pub enabled: bool,
    pub algorithm: SimilarityAlgorithm,
    /// Must be strictly exceeded for a semantic hit
    pub threshold: f64,
    /// Upper bound on durable entries scanned per lookup
    pub scan_limit: usize,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: SimilarityAlgorithm::Cosine,
            threshold: 0.85,
            scan_limit: 100,
        }
    }
}

/// All cache tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub memory: MemoryCacheSettings,
    pub durable: DurableCacheSettings,
    pub distributed: DistributedCacheSettings,
    pub similarity: SimilaritySettings,
}

/// Budget limits, in the accounting unit (USD); `None` means unlimited
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
    pub per_user: Option<f64>,
    /// Fraction of a limit at which a warning fires
    pub alert_threshold: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daily: None,
            monthly: None,
            per_user: None,
            alert_threshold: 0.8,
        }
    }
}

/// Ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub path: String,
    pub retention_days: u32,
    pub budgets: BudgetSettings,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: "switchboard_ledger.db".to_string(),
            retention_days: 90,
            budgets: BudgetSettings::default(),
        }
    }
}

/// Health probe loop settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            timeout_ms: 5_000,
        }
    }
}

/// Top-level switchboard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub strategy: RoutingStrategy,
    pub providers: HashMap<String, ProviderSettings>,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub ledger: LedgerSettings,
    pub health_check: HealthCheckSettings,
}

impl SwitchboardConfig {
    /// Load from a config file (TOML/JSON/YAML by extension) with
    /// `SWITCHBOARD__`-prefixed environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("SWITCHBOARD").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Settings for a provider, falling back to defaults when unconfigured
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }
}
