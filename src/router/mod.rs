//! Router and dispatcher
//!
//! [`Switchboard`] is the single mediation core: it owns the provider
//! adapters, their circuit breakers and load records, the cache engine, and
//! the usage ledger. Lifecycle is explicit — construct with [`Switchboard::new`],
//! serve with [`Switchboard::dispatch`] / [`Switchboard::dispatch_streaming`],
//! tear down with [`Switchboard::close`]. No global state.

pub mod breaker;
pub mod limiter;
pub mod strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, HealthReport, ProviderAdapter};
use crate::cache::fingerprint::{normalize_messages, PromptKey};
use crate::cache::{CacheEngine, CacheTier, CachedEntry, EntryMetadata};
use crate::config::{ProviderSettings, RoutingStrategy, SwitchboardConfig};
use crate::events::{EventKind, EventSink, SwitchboardEvent};
use crate::ledger::budget::BudgetScope;
use crate::ledger::pricing::{effective_cost, estimate_cost, estimate_tokens};
use crate::ledger::UsageLedger;
use crate::types::{
    Capability, CompletionRequest, CompletionResponse, ModelPricing, ProviderDescriptor,
    StreamFragment, StreamSink, TokenUsage, UsageRow,
};
use crate::SwitchboardError;

use breaker::{Admission, CircuitBreaker, CircuitState, CircuitTransition};
use limiter::LoadLimiter;
use strategy::{order_attempts, Candidate};

/// Errors surfaced to dispatch callers; cache and ledger failures are
/// absorbed before they get here
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no eligible provider: {0}")]
    ProviderUnavailable(String),

    #[error("budget exceeded for {scope}: {used:.4} of {limit:.4} USD")]
    BudgetExceeded {
        scope: BudgetScope,
        used: f64,
        limit: f64,
    },

    #[error("dispatch cancelled by caller")]
    Cancelled,

    #[error("provider {provider} rejected the request: {source}")]
    Provider {
        provider: String,
        #[source]
        source: AdapterError,
    },

    #[error("dispatch failed after {attempts} attempts: {last}")]
    DispatchFailed {
        attempts: u32,
        #[source]
        last: AdapterError,
    },
}

/// A mediated request: the completion plus routing controls
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub completion: CompletionRequest,
    /// Explicit provider; eligible means first attempt, ineligible falls
    /// back to strategy selection
    pub provider: Option<String>,
    pub required_capabilities: Vec<Capability>,
    /// Caller-supplied input token estimate; derived from the prompt text
    /// when absent
    pub estimated_input_tokens: Option<u32>,
    /// Admit even when a budget scope is exceeded
    pub budget_override: bool,
    /// Overall deadline for the whole dispatch including failover
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn new(completion: CompletionRequest) -> Self {
        Self {
            completion,
            provider: None,
            required_capabilities: Vec::new(),
            estimated_input_tokens: None,
            budget_override: false,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_budget_override(mut self) -> Self {
        self.budget_override = true;
        self
    }
}

/// Result of a successful dispatch
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: CompletionResponse,
    pub provider: String,
    pub attempts: u32,
    pub latency_ms: u64,
    /// Set when the response came from the cache
    pub cache_tier: Option<CacheTier>,
    /// Set when the cache hit was a semantic one
    pub similarity: Option<f64>,
}

impl DispatchOutcome {
    pub fn from_cache(&self) -> bool {
        self.cache_tier.is_some()
    }
}

/// Rolling health view of one provider
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub circuit: CircuitState,
    pub healthy: bool,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub latency_ema_ms: f64,
    pub success_rate: f64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct ProviderMetrics {
    latency_ema_ms: f64,
    successes: u64,
    failures: u64,
    healthy: bool,
    last_error: Option<String>,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            latency_ema_ms: 0.0,
            successes: 0,
            failures: 0,
            healthy: true,
            last_error: None,
        }
    }
}

impl ProviderMetrics {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn observe_latency(&mut self, sample_ms: f64) {
        const ALPHA: f64 = 0.3;
        if self.latency_ema_ms == 0.0 {
            self.latency_ema_ms = sample_ms;
        } else {
            self.latency_ema_ms = ALPHA * sample_ms + (1.0 - ALPHA) * self.latency_ema_ms;
        }
    }
}

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    descriptor: ProviderDescriptor,
    settings: ProviderSettings,
    breaker: CircuitBreaker,
    metrics: Mutex<ProviderMetrics>,
}

/// Sink wrapper that remembers whether anything reached the caller yet;
/// failover is only legal while it is still pristine
struct DeliveryTrackingSink {
    inner: Arc<dyn StreamSink>,
    delivered: AtomicBool,
}

impl DeliveryTrackingSink {
    fn new(inner: Arc<dyn StreamSink>) -> Self {
        Self {
            inner,
            delivered: AtomicBool::new(false),
        }
    }

    fn anything_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}

impl StreamSink for DeliveryTrackingSink {
    fn deliver(&self, fragment: StreamFragment) {
        self.delivered.store(true, Ordering::Release);
        self.inner.deliver(fragment);
    }
}

enum CallOutcome {
    Ok(CompletionResponse),
    Cancelled,
    Failed(AdapterError),
}

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// The mediation core
pub struct Switchboard {
    config: SwitchboardConfig,
    providers: HashMap<String, Arc<ProviderEntry>>,
    limiter: LoadLimiter,
    cache: CacheEngine,
    ledger: UsageLedger,
    events: Arc<dyn EventSink>,
    round_robin: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Switchboard {
    /// Build the core: open the cache and ledger stores, register every
    /// enabled adapter, and start the health and maintenance loops
    pub async fn new(
        config: SwitchboardConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, SwitchboardError> {
        let cache = CacheEngine::new(config.cache.clone(), Arc::clone(&events)).await?;
        let ledger = UsageLedger::open(&config.ledger, Arc::clone(&events)).await?;
        let limiter = LoadLimiter::new();

        let mut providers = HashMap::new();
        for adapter in adapters {
            let descriptor = adapter.describe();
            let name = descriptor.name.clone();
            let settings = config.provider(&name);
            if !settings.enabled {
                info!("provider {name} disabled by configuration, skipping");
                continue;
            }
            limiter.register(&name, settings.max_concurrent);
            providers.insert(
                name.clone(),
                Arc::new(ProviderEntry {
                    adapter,
                    descriptor,
                    settings,
                    breaker: CircuitBreaker::new(config.circuit_breaker),
                    metrics: Mutex::new(ProviderMetrics::default()),
                }),
            );
            info!("provider {name} registered");
        }
        if providers.is_empty() {
            warn!("no providers registered; only cache hits can be served");
        }

        let this = Arc::new(Self {
            config,
            providers,
            limiter,
            cache,
            ledger,
            events,
            round_robin: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if this.config.health_check.enabled && !this.providers.is_empty() {
            tasks.push(spawn_health_loop(Arc::clone(&this)));
        }
        tasks.push(spawn_maintenance_loop(Arc::clone(&this)));
        *this.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;

        Ok(this)
    }

    /// Stop the background loops and flush the cache write-behind queue
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.cache.close().await;
        info!("switchboard closed");
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(SwitchboardEvent::now(kind));
    }

    fn emit_circuit(&self, provider: &str, transition: Option<CircuitTransition>) {
        match transition {
            Some(CircuitTransition::Opened {
                consecutive_failures,
            }) => {
                warn!("circuit opened for {provider} after {consecutive_failures} failures");
                self.emit(EventKind::CircuitOpen {
                    provider: provider.to_string(),
                    consecutive_failures,
                });
            }
            Some(CircuitTransition::HalfOpened) => {
                info!("circuit half-open for {provider}");
                self.emit(EventKind::CircuitHalfOpen {
                    provider: provider.to_string(),
                });
            }
            Some(CircuitTransition::Closed) => {
                info!("circuit closed for {provider}");
                self.emit(EventKind::CircuitClosed {
                    provider: provider.to_string(),
                });
            }
            None => {}
        }
    }

    /// Execute a request and return the complete response
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_inner(request, None).await
    }

    /// Execute a request, streaming fragments to `sink` as they arrive.
    /// Failover stops the moment any fragment has been delivered.
    pub async fn dispatch_streaming(
        &self,
        request: DispatchRequest,
        sink: Arc<dyn StreamSink>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_inner(request, Some(Arc::new(DeliveryTrackingSink::new(sink))))
            .await
    }

    async fn dispatch_inner(
        &self,
        request: DispatchRequest,
        sink: Option<Arc<DeliveryTrackingSink>>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let deadline = request.timeout.map(|t| started + t);

        if request.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let user = request.completion.user.clone();
        if !request.budget_override {
            if let Some(signal) = self.ledger.exceeded_budget(user.as_deref()) {
                return Err(DispatchError::BudgetExceeded {
                    scope: signal.scope,
                    used: signal.used,
                    limit: signal.limit,
                });
            }
        }

        let key = PromptKey::for_request(request.provider.as_deref(), &request.completion);
        let normalized_prompt = normalize_messages(&request.completion.messages);
        let estimated_input = request
            .estimated_input_tokens
            .unwrap_or_else(|| estimate_tokens(&request.completion.prompt_text()));

        if let Some(hit) = self
            .cache
            .get(
                &key,
                &normalized_prompt,
                request.provider.as_deref(),
                Some(request.completion.model.as_str()),
            )
            .await
        {
            let latency_ms = started.elapsed().as_millis() as u64;
            self.ledger
                .record(UsageRow::for_cache_hit(
                    hit.entry.provider.clone(),
                    hit.entry.model.clone(),
                    user,
                    estimated_input,
                    latency_ms,
                ))
                .await;
            return Ok(DispatchOutcome {
                response: response_from_entry(&hit.entry),
                provider: hit.entry.provider.clone(),
                attempts: 0,
                latency_ms,
                cache_tier: Some(hit.tier),
                similarity: hit.similarity,
            });
        }

        let plan = self.build_attempt_plan(&request, estimated_input);
        if plan.is_empty() {
            return Err(DispatchError::ProviderUnavailable(
                "no provider satisfies the request constraints".to_string(),
            ));
        }
        self.emit(EventKind::RoutingSelected {
            provider: plan[0].provider.clone(),
            model: plan[0].model.clone(),
            strategy: self.config.strategy,
            attempt_plan: plan.iter().map(|c| c.provider.clone()).collect(),
        });

        self.run_attempts(&request, sink, &key, &normalized_prompt, plan, deadline, started)
            .await
    }

    /// Eligibility filter plus strategy ordering; the explicit provider, if
    /// eligible, is moved to the front of the strategy order
    fn build_attempt_plan(&self, request: &DispatchRequest, estimated_input: u32) -> Vec<Candidate> {
        let expected_output = request.completion.max_tokens.unwrap_or(1000);
        let mut candidates = Vec::new();

        for (name, entry) in &self.providers {
            if !entry.descriptor.supports(&request.required_capabilities) {
                continue;
            }
            if !entry.breaker.is_admitting() {
                continue;
            }
            if !self.limiter.has_headroom(name) {
                continue;
            }

            let (model, pricing) = resolve_model(&entry.descriptor, &request.completion.model);
            let metrics = entry.metrics.lock().unwrap_or_else(|e| e.into_inner());
            let mut capability_matches = request.required_capabilities.len() as u32;
            if request.completion.tools_enabled
                && entry.descriptor.capabilities.contains(&Capability::Tools)
            {
                capability_matches += 1;
            }
            if request.completion.grounding_enabled
                && entry.descriptor.capabilities.contains(&Capability::Grounding)
            {
                capability_matches += 1;
            }

            candidates.push(Candidate {
                provider: name.clone(),
                model,
                weight: entry.settings.weight,
                latency_ema_ms: metrics.latency_ema_ms,
                success_rate: metrics.success_rate(),
                estimated_cost: estimate_cost(&pricing, estimated_input, expected_output),
                capability_matches,
            });
        }

        let tick = match self.config.strategy {
            RoutingStrategy::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        let mut plan = order_attempts(self.config.strategy, candidates, tick);

        if let Some(explicit) = &request.provider {
            if let Some(position) = plan.iter().position(|c| &c.provider == explicit) {
                let preferred = plan.remove(position);
                plan.insert(0, preferred);
            } else {
                debug!("explicit provider {explicit} ineligible, falling back to strategy order");
            }
        }
        plan
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        request: &DispatchRequest,
        sink: Option<Arc<DeliveryTrackingSink>>,
        key: &PromptKey,
        normalized_prompt: &str,
        plan: Vec<Candidate>,
        deadline: Option<Instant>,
        started: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        let max_attempts = self.config.retry.max_retries.max(1);
        let mut attempts = 0u32;
        let mut last_error: Option<AdapterError> = None;
        let mut failed_provider: Option<String> = None;
        let user = request.completion.user.clone();

        'cycle: loop {
            let mut admitted_this_cycle = false;

            for candidate in &plan {
                if attempts >= max_attempts {
                    break 'cycle;
                }
                if request.cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break 'cycle;
                }

                let entry = match self.providers.get(&candidate.provider) {
                    Some(entry) => Arc::clone(entry),
                    None => continue,
                };

                let (admission, transition) = entry.breaker.try_acquire();
                self.emit_circuit(&candidate.provider, transition);
                let probe = match admission {
                    Admission::Admitted { probe } => probe,
                    Admission::Rejected => continue,
                };

                let Some(permit) = self.limiter.try_acquire(&candidate.provider) else {
                    // Load refused after breaker admission: hand the probe
                    // slot back without counting an outcome
                    entry.breaker.on_cancelled(probe);
                    continue;
                };

                admitted_this_cycle = true;
                attempts += 1;

                if let Some(from) = failed_provider.take() {
                    if from != candidate.provider {
                        self.emit(EventKind::FailoverAttempt {
                            from,
                            to: candidate.provider.clone(),
                            attempt: attempts,
                        });
                    }
                }

                let mut completion = request.completion.clone();
                completion.model = candidate.model.clone();

                let call_started = Instant::now();
                let outcome = self
                    .call_adapter(&entry, &completion, sink.as_deref(), deadline, &request.cancel)
                    .await;
                let call_latency_ms = call_started.elapsed().as_millis() as u64;
                drop(permit);

                match outcome {
                    CallOutcome::Ok(response) => {
                        let transition = entry.breaker.on_success(probe);
                        self.emit_circuit(&candidate.provider, transition);
                        {
                            let mut metrics =
                                entry.metrics.lock().unwrap_or_else(|e| e.into_inner());
                            metrics.successes += 1;
                            metrics.observe_latency(call_latency_ms as f64);
                            metrics.last_error = None;
                        }

                        let pricing = pricing_for(&entry.descriptor, &candidate.model);
                        let cost = effective_cost(&pricing, &response.usage, response.native_cost);

                        // Cache write and ledger write are independent;
                        // either failing is absorbed inside its subsystem
                        self.cache
                            .put(
                                key,
                                serde_json::to_value(&response)
                                    .unwrap_or(serde_json::Value::Null),
                                EntryMetadata {
                                    provider: candidate.provider.clone(),
                                    model: candidate.model.clone(),
                                    normalized_prompt: normalized_prompt.to_string(),
                                    tokens: response.usage.total(),
                                    cost,
                                },
                            )
                            .await;
                        self.ledger
                            .record(UsageRow::new(
                                candidate.provider.clone(),
                                candidate.model.clone(),
                                user.clone(),
                                response.usage,
                                cost,
                                call_latency_ms,
                                true,
                            ))
                            .await;

                        return Ok(DispatchOutcome {
                            response,
                            provider: candidate.provider.clone(),
                            attempts,
                            latency_ms: started.elapsed().as_millis() as u64,
                            cache_tier: None,
                            similarity: None,
                        });
                    }
                    CallOutcome::Cancelled => {
                        entry.breaker.on_cancelled(probe);
                        return Err(DispatchError::Cancelled);
                    }
                    CallOutcome::Failed(error) => {
                        self.record_failure(&entry, &candidate.provider, &candidate.model, probe, &error, call_latency_ms, user.clone())
                            .await;

                        if !error.is_retryable() {
                            return Err(DispatchError::Provider {
                                provider: candidate.provider.clone(),
                                source: error,
                            });
                        }

                        // A partially delivered stream cannot be retried
                        // anywhere
                        if sink.as_ref().is_some_and(|s| s.anything_delivered()) {
                            return Err(DispatchError::DispatchFailed {
                                attempts,
                                last: error,
                            });
                        }

                        warn!(
                            "attempt {attempts} on {} failed ({}), continuing failover",
                            candidate.provider,
                            error.kind()
                        );
                        failed_provider = Some(candidate.provider.clone());
                        last_error = Some(error);

                        if attempts >= max_attempts {
                            break 'cycle;
                        }
                        let delay = self.config.retry.backoff_delay(attempts);
                        tokio::select! {
                            _ = request.cancel.cancelled() => return Err(DispatchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            if !admitted_this_cycle {
                break;
            }
        }

        match last_error {
            Some(last) => Err(DispatchError::DispatchFailed { attempts, last }),
            None => Err(DispatchError::ProviderUnavailable(
                "no provider admitted the request".to_string(),
            )),
        }
    }

    /// Failure bookkeeping shared by the retryable and terminal paths:
    /// breaker (except for caller-shaped errors), metrics, and the ledger
    /// row for the completed attempt
    async fn record_failure(
        &self,
        entry: &ProviderEntry,
        provider: &str,
        model: &str,
        probe: bool,
        error: &AdapterError,
        latency_ms: u64,
        user: Option<String>,
    ) {
        // Auth and bad-request failures describe the request, not provider
        // health; they only trip the circuit via failed health probes
        if error.is_retryable() {
            let transition = entry.breaker.on_failure(probe);
            self.emit_circuit(provider, transition);
        } else {
            entry.breaker.on_cancelled(probe);
        }
        {
            let mut metrics = entry.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.failures += 1;
            metrics.last_error = Some(error.to_string());
        }
        self.ledger
            .record(UsageRow::new(
                provider.to_string(),
                model.to_string(),
                user,
                TokenUsage::default(),
                0.0,
                latency_ms,
                false,
            ))
            .await;
    }

    async fn call_adapter(
        &self,
        entry: &ProviderEntry,
        completion: &CompletionRequest,
        sink: Option<&DeliveryTrackingSink>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        let attempt_timeout = Duration::from_millis(entry.settings.timeout_ms);
        let effective_timeout = match deadline {
            Some(d) => attempt_timeout.min(d.saturating_duration_since(Instant::now())),
            None => attempt_timeout,
        };

        let call = async {
            match sink {
                Some(sink) => entry.adapter.execute_streaming(completion, sink).await,
                None => entry.adapter.execute_blocking(completion).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => CallOutcome::Cancelled,
            result = tokio::time::timeout(effective_timeout, call) => match result {
                Ok(Ok(response)) => CallOutcome::Ok(response),
                Ok(Err(AdapterError::Cancelled(_))) => CallOutcome::Cancelled,
                Ok(Err(error)) => CallOutcome::Failed(error),
                Err(_) => CallOutcome::Failed(AdapterError::Transient(
                    "adapter attempt timed out".to_string(),
                )),
            },
        }
    }

    /// Rolling status of every registered provider
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut status: Vec<ProviderStatus> = self
            .providers
            .iter()
            .map(|(name, entry)| {
                let metrics = entry.metrics.lock().unwrap_or_else(|e| e.into_inner());
                ProviderStatus {
                    name: name.clone(),
                    circuit: entry.breaker.state(),
                    healthy: metrics.healthy,
                    in_flight: self.limiter.in_flight(name),
                    max_concurrent: entry.settings.max_concurrent,
                    latency_ema_ms: metrics.latency_ema_ms,
                    success_rate: metrics.success_rate(),
                    successes: metrics.successes,
                    failures: metrics.failures,
                }
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }
}

/// Model the provider would serve: the requested id when offered, its
/// cheapest model otherwise
fn resolve_model(descriptor: &ProviderDescriptor, requested: &str) -> (String, ModelPricing) {
    if let Some(spec) = descriptor.models.get(requested) {
        return (spec.id.clone(), spec.pricing);
    }
    descriptor
        .models
        .values()
        .min_by(|a, b| {
            let cost_a = a.pricing.input_price + a.pricing.output_price;
            let cost_b = b.pricing.input_price + b.pricing.output_price;
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|spec| (spec.id.clone(), spec.pricing))
        .unwrap_or_else(|| (requested.to_string(), ModelPricing::new(0.0, 0.0)))
}

fn pricing_for(descriptor: &ProviderDescriptor, model: &str) -> ModelPricing {
    descriptor
        .models
        .get(model)
        .map(|spec| spec.pricing)
        .unwrap_or_else(|| ModelPricing::new(0.0, 0.0))
}

/// Rebuild a response from a cached payload. Entries written by this core
/// deserialize directly; foreign payloads are surfaced through the content
/// field.
fn response_from_entry(entry: &CachedEntry) -> CompletionResponse {
    match serde_json::from_value::<CompletionResponse>(entry.payload.clone()) {
        Ok(response) => response,
        Err(_) => CompletionResponse {
            content: entry
                .payload
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| entry.payload.to_string()),
            model: entry.model.clone(),
            usage: TokenUsage::default(),
            finish_reason: Some("cached".to_string()),
            native_cost: None,
        },
    }
}

fn spawn_health_loop(this: Arc<Switchboard>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(this.config.health_check.interval_ms.max(100));
        let probe_timeout = Duration::from_millis(this.config.health_check.timeout_ms.max(100));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = this.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for (name, entry) in &this.providers {
                let report = match tokio::time::timeout(probe_timeout, entry.adapter.health()).await
                {
                    Ok(report) => report,
                    Err(_) => HealthReport::unhealthy(
                        probe_timeout.as_millis() as u64,
                        "health probe timed out",
                    ),
                };

                {
                    let mut metrics = entry.metrics.lock().unwrap_or_else(|e| e.into_inner());
                    metrics.healthy = report.healthy;
                    if report.healthy {
                        metrics.observe_latency(report.latency_ms as f64);
                    } else {
                        metrics.last_error = report.detail.clone();
                    }
                }

                if !report.healthy {
                    debug!(
                        "health probe failed for {name}: {}",
                        report.detail.as_deref().unwrap_or("no detail")
                    );
                    let transition = entry.breaker.on_failure(false);
                    this.emit_circuit(name, transition);
                }
            }
        }
    })
}

fn spawn_maintenance_loop(this: Arc<Switchboard>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = this.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cache_purged = this.cache.run_maintenance().await;
            let ledger_purged = this.ledger.run_maintenance().await;
            debug!("maintenance pass: {cache_purged} cache entries, {ledger_purged} ledger rows purged");
        }
    })
}

#[cfg(test)]
mod dispatch_tests;
