use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::adapter::{AdapterResult, HealthReport};
use crate::events::BroadcastSink;
use crate::types::{ChannelSink, ChatMessage, ModelSpec};

/// Scripted adapter: pops one outcome per call, succeeding with a default
/// response once the script runs dry
struct MockAdapter {
    name: String,
    capabilities: Vec<Capability>,
    latency: Duration,
    fragments: Vec<StreamFragment>,
    script: Mutex<VecDeque<AdapterResult<String>>>,
    calls: AtomicU32,
}

impl MockAdapter {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: vec![Capability::Chat, Capability::Tools],
            latency: Duration::from_millis(1),
            fragments: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn with_fragments(mut self, fragments: Vec<StreamFragment>) -> Self {
        self.fragments = fragments;
        self
    }

    fn script_err(&self, error: AdapterError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    fn script_ok(&self, content: &str) {
        self.script.lock().unwrap().push_back(Ok(content.to_string()));
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> AdapterResult<String> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("answer from {}", self.name)))
    }

    fn response(&self, model: &str, content: String) -> CompletionResponse {
        CompletionResponse {
            content,
            model: model.to_string(),
            usage: TokenUsage::new(12, 7),
            finish_reason: Some("stop".to_string()),
            native_cost: None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(&self.name)
            .with_model(ModelSpec {
                id: "m1".to_string(),
                context_window: 128_000,
                max_output_tokens: 4096,
                pricing: ModelPricing::new(0.000003, 0.000015),
            })
            .with_capabilities(self.capabilities.iter().copied())
    }

    async fn execute_blocking(
        &self,
        request: &CompletionRequest,
    ) -> AdapterResult<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        self.next_outcome()
            .map(|content| self.response(&request.model, content))
    }

    async fn execute_streaming(
        &self,
        request: &CompletionRequest,
        sink: &dyn StreamSink,
    ) -> AdapterResult<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        for fragment in &self.fragments {
            sink.deliver(fragment.clone());
        }
        self.next_outcome().map(|content| {
            sink.deliver(StreamFragment::Finish {
                reason: Some("stop".to_string()),
            });
            self.response(&request.model, content)
        })
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy(self.latency.as_millis() as u64)
    }
}

fn test_config(dir: &tempfile::TempDir) -> SwitchboardConfig {
    let mut config = SwitchboardConfig::default();
    config.cache.durable.path = dir.path().join("cache.db").to_string_lossy().into_owned();
    config.ledger.path = dir.path().join("ledger.db").to_string_lossy().into_owned();
    config.health_check.enabled = false;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn chat_request(prompt: &str) -> CompletionRequest {
    CompletionRequest::new("m1", vec![ChatMessage::user(prompt)])
}

fn export_range() -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
    (
        chrono::Utc::now() - chrono::Duration::hours(1),
        chrono::Utc::now() + chrono::Duration::hours(1),
    )
}

async fn recorded_rows(core: &Switchboard) -> Vec<UsageRow> {
    let (from, to) = export_range();
    serde_json::from_str(&core.ledger().export_json(from, to).await.unwrap()).unwrap()
}

#[tokio::test]
async fn cache_fast_hit_serves_without_providers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache.durable.enabled = false;
    let sink = Arc::new(BroadcastSink::new(64));
    let mut rx = sink.subscribe();
    let core = Switchboard::new(config, Vec::new(), sink).await.unwrap();

    // Pre-seed the fast tier with a foreign payload
    let key = PromptKey::compute(
        "provA",
        "m1",
        &[ChatMessage::user("hello")],
        Some(0.7),
        None,
    );
    core.cache()
        .put(
            &key,
            serde_json::json!({"text": "hi"}),
            crate::cache::EntryMetadata {
                provider: "provA".to_string(),
                model: "m1".to_string(),
                normalized_prompt: "hello".to_string(),
                tokens: 2,
                cost: 0.0,
            },
        )
        .await;

    let request = DispatchRequest::new(chat_request("hello").with_temperature(0.7))
        .with_provider("provA");
    let outcome = core.dispatch(request).await.unwrap();

    assert!(outcome.from_cache());
    assert_eq!(outcome.cache_tier, Some(CacheTier::Memory));
    assert_eq!(outcome.response.content, "hi");
    assert_eq!(outcome.provider, "provA");

    let mut saw_memory_hit = false;
    while let Ok(event) = rx.try_recv() {
        if let EventKind::CacheHit { tier, .. } = event.kind {
            saw_memory_hit |= tier == CacheTier::Memory;
        }
    }
    assert!(saw_memory_hit);

    let rows = recorded_rows(&core).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].cache_hit);
    assert_eq!(rows[0].cost, 0.0);
    assert_eq!(rows[0].output_tokens, 0);

    core.close().await;
}

#[tokio::test]
async fn circuit_opens_after_five_failures_and_rejects_the_sixth() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.retry.max_retries = 1;
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();

    let adapter = Arc::new(MockAdapter::new("provA"));
    for _ in 0..6 {
        adapter.script_err(AdapterError::Transient("boom".to_string()));
    }
    let core = Switchboard::new(
        config,
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        sink,
    )
    .await
    .unwrap();

    for _ in 0..5 {
        let err = core
            .dispatch(DispatchRequest::new(chat_request("hello")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DispatchFailed { .. }));
    }
    assert_eq!(adapter.calls(), 5);
    assert_eq!(core.provider_status()[0].circuit, CircuitState::Open);

    let mut saw_open = false;
    while let Ok(event) = rx.try_recv() {
        if let EventKind::CircuitOpen {
            provider,
            consecutive_failures,
        } = event.kind
        {
            assert_eq!(provider, "provA");
            assert_eq!(consecutive_failures, 5);
            saw_open = true;
        }
    }
    assert!(saw_open);

    // The sixth dispatch is refused without touching the adapter
    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProviderUnavailable(_)));
    assert_eq!(adapter.calls(), 5);

    core.close().await;
}

#[tokio::test]
async fn rate_limited_primary_fails_over_to_the_slower_provider() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.strategy = RoutingStrategy::LatencyBased;
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();

    let fast = Arc::new(MockAdapter::new("fast").with_latency(Duration::from_millis(2)));
    let slow = Arc::new(MockAdapter::new("slow").with_latency(Duration::from_millis(30)));
    let core = Switchboard::new(
        config,
        vec![
            Arc::clone(&fast) as Arc<dyn ProviderAdapter>,
            Arc::clone(&slow) as Arc<dyn ProviderAdapter>,
        ],
        sink,
    )
    .await
    .unwrap();

    // Train the latency EMAs so the strategy order is deterministic
    core.dispatch(DispatchRequest::new(chat_request("warm fast")).with_provider("fast"))
        .await
        .unwrap();
    core.dispatch(DispatchRequest::new(chat_request("warm slow")).with_provider("slow"))
        .await
        .unwrap();

    fast.script_err(AdapterError::RateLimited("429".to_string()));
    slow.script_ok("answer from slow");
    let outcome = core
        .dispatch(DispatchRequest::new(chat_request("the real question")))
        .await
        .unwrap();

    assert_eq!(outcome.provider, "slow");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.response.content, "answer from slow");

    let mut saw_failover = false;
    while let Ok(event) = rx.try_recv() {
        if let EventKind::FailoverAttempt { from, to, .. } = event.kind {
            assert_eq!(from, "fast");
            assert_eq!(to, "slow");
            assert_ne!(from, to);
            saw_failover = true;
        }
    }
    assert!(saw_failover);

    let status = core.provider_status();
    let fast_status = status.iter().find(|s| s.name == "fast").unwrap();
    assert_eq!(fast_status.failures, 1);
    assert_eq!(fast_status.circuit, CircuitState::Closed);

    core.close().await;
}

#[tokio::test]
async fn budget_exceeded_blocks_dispatches_unless_overridden() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.ledger.budgets.daily = Some(1.0);
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();

    let adapter = Arc::new(MockAdapter::new("provA"));
    let core = Switchboard::new(
        config,
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        sink,
    )
    .await
    .unwrap();

    let spend = |cost: f64| {
        UsageRow::new(
            "provA",
            "m1",
            None,
            TokenUsage::new(1000, 500),
            cost,
            100,
            true,
        )
    };
    core.ledger().record(spend(0.85)).await;
    core.ledger().record(spend(0.20)).await;

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind.name());
    }
    assert!(kinds.contains(&"budget:warning"));
    assert!(kinds.contains(&"budget:exceeded"));

    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::BudgetExceeded { .. }));
    assert_eq!(adapter.calls(), 0);

    // The explicit override still goes through
    let outcome = core
        .dispatch(DispatchRequest::new(chat_request("hello")).with_budget_override())
        .await
        .unwrap();
    assert_eq!(outcome.provider, "provA");
    assert_eq!(adapter.calls(), 1);

    core.close().await;
}

#[tokio::test]
async fn single_provider_exhausts_max_retries_before_dispatch_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let adapter = Arc::new(MockAdapter::new("provA"));
    for _ in 0..3 {
        adapter.script_err(AdapterError::Transient("boom".to_string()));
    }
    let core = Switchboard::new(
        config,
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")))
        .await
        .unwrap_err();
    match err {
        DispatchError::DispatchFailed { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, AdapterError::Transient(_)));
        }
        other => panic!("expected DispatchFailed, got {other:?}"),
    }
    assert_eq!(adapter.calls(), 3);

    core.close().await;
}

#[tokio::test]
async fn mid_stream_failure_is_not_redispatched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let prov_a = Arc::new(
        MockAdapter::new("provA")
            .with_latency(Duration::from_millis(1))
            .with_fragments(vec![
                StreamFragment::Text {
                    content: "partial ".to_string(),
                },
                StreamFragment::Text {
                    content: "answer".to_string(),
                },
            ]),
    );
    prov_a.script_err(AdapterError::Transient("connection dropped".to_string()));
    let prov_b = Arc::new(MockAdapter::new("provB"));

    let core = Switchboard::new(
        config,
        vec![
            Arc::clone(&prov_a) as Arc<dyn ProviderAdapter>,
            Arc::clone(&prov_b) as Arc<dyn ProviderAdapter>,
        ],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let (sink, mut rx) = ChannelSink::new();
    let err = core
        .dispatch_streaming(
            DispatchRequest::new(chat_request("stream this")).with_provider("provA"),
            Arc::new(sink),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::DispatchFailed { .. }));
    assert_eq!(prov_b.calls(), 0);

    let mut delivered = 0;
    while rx.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 2);

    let status = core.provider_status();
    let prov_a_status = status.iter().find(|s| s.name == "provA").unwrap();
    assert_eq!(prov_a_status.failures, 1);

    core.close().await;
}

#[tokio::test]
async fn streaming_success_delivers_fragments_and_accounts_usage() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let adapter = Arc::new(MockAdapter::new("provA").with_fragments(vec![
        StreamFragment::Text {
            content: "hello ".to_string(),
        },
        StreamFragment::Text {
            content: "world".to_string(),
        },
    ]));
    let core = Switchboard::new(
        config,
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let (sink, mut rx) = ChannelSink::new();
    let outcome = core
        .dispatch_streaming(
            DispatchRequest::new(chat_request("stream this")),
            Arc::new(sink),
        )
        .await
        .unwrap();

    assert_eq!(outcome.provider, "provA");
    let mut texts = 0;
    let mut finishes = 0;
    while let Ok(fragment) = rx.try_recv() {
        match fragment {
            StreamFragment::Text { .. } => texts += 1,
            StreamFragment::Finish { .. } => finishes += 1,
            _ => {}
        }
    }
    assert_eq!(texts, 2);
    assert_eq!(finishes, 1);

    let rows = recorded_rows(&core).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert!(rows[0].cost > 0.0);

    core.close().await;
}

#[tokio::test]
async fn non_retryable_error_surfaces_immediately_without_failover() {
    let dir = tempfile::tempdir().unwrap();
    let prov_a = Arc::new(MockAdapter::new("provA"));
    prov_a.script_err(AdapterError::BadRequest("malformed".to_string()));
    let prov_b = Arc::new(MockAdapter::new("provB"));
    let core = Switchboard::new(
        test_config(&dir),
        vec![
            Arc::clone(&prov_a) as Arc<dyn ProviderAdapter>,
            Arc::clone(&prov_b) as Arc<dyn ProviderAdapter>,
        ],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")).with_provider("provA"))
        .await
        .unwrap_err();
    match err {
        DispatchError::Provider { provider, source } => {
            assert_eq!(provider, "provA");
            assert!(matches!(source, AdapterError::BadRequest(_)));
        }
        other => panic!("expected Provider error, got {other:?}"),
    }
    assert_eq!(prov_b.calls(), 0);

    // A request error does not move the circuit
    let status = core.provider_status();
    let prov_a_status = status.iter().find(|s| s.name == "provA").unwrap();
    assert_eq!(prov_a_status.circuit, CircuitState::Closed);
    assert_eq!(prov_a_status.failures, 1);

    core.close().await;
}

#[tokio::test]
async fn capability_constraints_filter_providers() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(
        MockAdapter::new("provA").with_capabilities(vec![Capability::Chat]),
    );
    let core = Switchboard::new(
        test_config(&dir),
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let err = core
        .dispatch(DispatchRequest::new(chat_request("describe this image")).require(Capability::Vision))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProviderUnavailable(_)));
    assert_eq!(adapter.calls(), 0);

    core.close().await;
}

#[tokio::test]
async fn successful_dispatch_writes_through_and_later_hits_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new("provA"));
    let core = Switchboard::new(
        test_config(&dir),
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let first = core
        .dispatch(DispatchRequest::new(chat_request("hello").with_temperature(0.2)))
        .await
        .unwrap();
    assert!(!first.from_cache());
    assert_eq!(adapter.calls(), 1);

    // Exactly one usage row for the successful dispatch
    let rows = recorded_rows(&core).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);

    let second = core
        .dispatch(DispatchRequest::new(chat_request("hello").with_temperature(0.2)))
        .await
        .unwrap();
    assert!(second.from_cache());
    assert_eq!(second.response.content, first.response.content);
    assert_eq!(adapter.calls(), 1);

    // The cached dispatch adds its synthetic zero-cost row
    let rows = recorded_rows(&core).await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.cache_hit && r.cost == 0.0));

    core.close().await;
}

#[tokio::test]
async fn cancellation_aborts_the_call_without_counting_failure() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::new("provA").with_latency(Duration::from_secs(10)));
    let core = Switchboard::new(
        test_config(&dir),
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")).with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));

    let status = core.provider_status();
    assert_eq!(status[0].in_flight, 0);
    assert_eq!(status[0].failures, 0);
    assert_eq!(status[0].circuit, CircuitState::Closed);

    core.close().await;
}

#[tokio::test]
async fn adapter_timeout_is_a_retryable_transient() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.retry.max_retries = 1;
    config
        .providers
        .insert("provA".to_string(), crate::config::ProviderSettings {
            timeout_ms: 20,
            ..Default::default()
        });

    let adapter = Arc::new(MockAdapter::new("provA").with_latency(Duration::from_millis(500)));
    let core = Switchboard::new(
        config,
        vec![Arc::clone(&adapter) as Arc<dyn ProviderAdapter>],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    let err = core
        .dispatch(DispatchRequest::new(chat_request("hello")))
        .await
        .unwrap_err();
    match err {
        DispatchError::DispatchFailed { last, .. } => {
            assert!(matches!(last, AdapterError::Transient(_)));
        }
        other => panic!("expected DispatchFailed, got {other:?}"),
    }

    core.close().await;
}

#[tokio::test]
async fn round_robin_rotates_across_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.strategy = RoutingStrategy::RoundRobin;
    config.cache.durable.enabled = false;

    let prov_a = Arc::new(MockAdapter::new("provA"));
    let prov_b = Arc::new(MockAdapter::new("provB"));
    let core = Switchboard::new(
        config,
        vec![
            Arc::clone(&prov_a) as Arc<dyn ProviderAdapter>,
            Arc::clone(&prov_b) as Arc<dyn ProviderAdapter>,
        ],
        Arc::new(crate::events::NullSink),
    )
    .await
    .unwrap();

    // Distinct prompts so the cache never short-circuits the rotation
    for i in 0..4 {
        core.dispatch(DispatchRequest::new(chat_request(&format!("question {i}"))))
            .await
            .unwrap();
    }
    assert_eq!(prov_a.calls(), 2);
    assert_eq!(prov_b.calls(), 2);

    core.close().await;
}
