use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use super::budget::{BudgetScope, BudgetSignalKind};
use super::*;
use crate::config::{BudgetSettings, LedgerSettings};
use crate::events::{BroadcastSink, NullSink};
use crate::types::{TokenUsage, UsageRow};

fn settings(daily: Option<f64>) -> LedgerSettings {
    LedgerSettings {
        path: String::new(), // in-memory store ignores the path
        retention_days: 90,
        budgets: BudgetSettings {
            daily,
            monthly: None,
            per_user: None,
            alert_threshold: 0.8,
        },
    }
}

fn row(provider: &str, model: &str, cost: f64) -> UsageRow {
    UsageRow::new(
        provider,
        model,
        Some("alice".to_string()),
        TokenUsage::new(100, 50),
        cost,
        250,
        true,
    )
}

#[tokio::test]
async fn record_then_aggregate_reflects_the_row() {
    let ledger = UsageLedger::open_in_memory(&settings(None), Arc::new(NullSink))
        .await
        .unwrap();
    ledger.record(row("provA", "m1", 0.02)).await;
    ledger.record(row("provB", "m2", 0.05)).await;

    let from = Utc::now() - ChronoDuration::hours(1);
    let to = Utc::now() + ChronoDuration::hours(1);
    let summary = ledger.usage_by_period(from, to).await.unwrap();

    assert_eq!(summary.total.requests, 2);
    assert_eq!(summary.total.input_tokens, 200);
    assert!((summary.total.cost - 0.07).abs() < 1e-9);
    assert_eq!(summary.by_provider.len(), 2);
    // Ordered by cost, most expensive first
    assert_eq!(summary.by_provider[0].0, "provB");
    assert_eq!(summary.by_user.len(), 1);
    assert_eq!(summary.by_user[0].0, "alice");
}

#[tokio::test]
async fn budget_warning_then_exceeded_gate_dispatches() {
    let sink = Arc::new(BroadcastSink::new(64));
    let mut rx = sink.subscribe();
    let ledger = UsageLedger::open_in_memory(&settings(Some(1.0)), sink)
        .await
        .unwrap();

    assert!(ledger.exceeded_budget(None).is_none());

    ledger.record(row("provA", "m1", 0.85)).await;
    assert!(ledger.exceeded_budget(None).is_none());

    ledger.record(row("provA", "m1", 0.20)).await;
    let blocked = ledger.exceeded_budget(None).unwrap();
    assert_eq!(blocked.scope, BudgetScope::Daily);
    assert_eq!(blocked.kind, BudgetSignalKind::Exceeded);
    assert!((blocked.used - 1.05).abs() < 1e-9);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind.name());
    }
    assert!(kinds.contains(&"budget:warning"));
    assert!(kinds.contains(&"budget:exceeded"));
}

#[tokio::test]
async fn unlimited_budget_never_blocks() {
    let ledger = UsageLedger::open_in_memory(&settings(None), Arc::new(NullSink))
        .await
        .unwrap();
    ledger.record(row("provA", "m1", 5000.0)).await;
    assert!(ledger.exceeded_budget(None).is_none());
    assert!(ledger.exceeded_budget(Some("alice")).is_none());
}

#[tokio::test]
async fn provider_comparison_separates_success_rates() {
    let ledger = UsageLedger::open_in_memory(&settings(None), Arc::new(NullSink))
        .await
        .unwrap();
    ledger.record(row("provA", "m1", 0.02)).await;
    let mut failed = row("provA", "m1", 0.0);
    failed.success = false;
    ledger.record(failed).await;
    ledger.record(row("provB", "m2", 0.01)).await;

    let from = Utc::now() - ChronoDuration::hours(1);
    let to = Utc::now() + ChronoDuration::hours(1);
    let comparison = ledger.provider_comparison(from, to).await.unwrap();

    let prov_a = comparison.iter().find(|c| c.provider == "provA").unwrap();
    assert_eq!(prov_a.requests, 2);
    assert!((prov_a.success_rate - 0.5).abs() < 1e-9);
    let prov_b = comparison.iter().find(|c| c.provider == "provB").unwrap();
    assert!((prov_b.success_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn exports_carry_every_row() {
    let ledger = UsageLedger::open_in_memory(&settings(None), Arc::new(NullSink))
        .await
        .unwrap();
    ledger.record(row("provA", "m1", 0.02)).await;
    ledger.record(row("provB", "m2", 0.03)).await;

    let from = Utc::now() - ChronoDuration::hours(1);
    let to = Utc::now() + ChronoDuration::hours(1);

    let json = ledger.export_json(from, to).await.unwrap();
    let parsed: Vec<UsageRow> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.len(), 2);

    let csv = ledger.export_csv(from, to).await.unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("id,timestamp,provider"));
    assert!(lines[1].contains("provA"));
}

#[tokio::test]
async fn maintenance_purges_old_rows_only() {
    let ledger = UsageLedger::open_in_memory(&settings(None), Arc::new(NullSink))
        .await
        .unwrap();
    let mut old = row("provA", "m1", 0.01);
    old.timestamp = Utc::now() - ChronoDuration::days(120);
    ledger.record(old).await;
    ledger.record(row("provA", "m1", 0.01)).await;

    assert_eq!(ledger.run_maintenance().await, 1);

    let from = Utc::now() - ChronoDuration::days(365);
    let to = Utc::now() + ChronoDuration::hours(1);
    let summary = ledger.usage_by_period(from, to).await.unwrap();
    assert_eq!(summary.total.requests, 1);
}

#[tokio::test]
async fn cache_rows_cost_nothing_toward_budgets() {
    let ledger = UsageLedger::open_in_memory(&settings(Some(1.0)), Arc::new(NullSink))
        .await
        .unwrap();
    for _ in 0..50 {
        ledger
            .record(UsageRow::for_cache_hit("provA", "m1", None, 100, 2))
            .await;
    }
    assert!(ledger.exceeded_budget(None).is_none());
}
