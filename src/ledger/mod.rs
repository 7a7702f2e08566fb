//! Token and cost ledger
//!
//! Durable, append-only record of every completed dispatch with aggregated
//! read views, budget enforcement, and alerting. `record` is synchronous
//! enough that a budget query issued right after it reflects the new row;
//! a failed persist is logged and emitted as `ledger:error` but never rolls
//! back the dispatch that produced it.

pub mod budget;
pub mod pricing;
pub mod store;

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::LedgerSettings;
use crate::events::{EventKind, EventSink, SwitchboardEvent};
use crate::types::UsageRow;

use budget::{BudgetBook, BudgetSignal, BudgetSignalKind, BudgetStatusView};
use store::LedgerStore;

/// Ledger subsystem errors; absorbed on the write path, surfaced on reads
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Aggregated totals over a set of usage rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub avg_latency_ms: f64,
}

/// `usage_by_period` result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total: UsageTotals,
    pub by_provider: Vec<(String, UsageTotals)>,
    pub by_model: Vec<(String, UsageTotals)>,
    pub by_user: Vec<(String, UsageTotals)>,
}

/// Per-provider comparison row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderComparison {
    pub provider: String,
    pub requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub cost_per_request: f64,
}

/// The usage and budget ledger
pub struct UsageLedger {
    store: LedgerStore,
    budgets: Mutex<BudgetBook>,
    retention_days: u32,
    events: Arc<dyn EventSink>,
}

impl UsageLedger {
    pub async fn open(
        settings: &LedgerSettings,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, LedgerError> {
        let store = LedgerStore::open(&settings.path).await?;
        let mut book = BudgetBook::new(&settings.budgets);
        for (scope_key, state) in store.load_budgets().await? {
            book.restore(&scope_key, state);
        }
        Ok(Self {
            store,
            budgets: Mutex::new(book),
            retention_days: settings.retention_days,
            events,
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory(
        settings: &LedgerSettings,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, LedgerError> {
        let store = LedgerStore::open_in_memory().await?;
        Ok(Self {
            store,
            budgets: Mutex::new(BudgetBook::new(&settings.budgets)),
            retention_days: settings.retention_days,
            events,
        })
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(SwitchboardEvent::now(kind));
    }

    /// Persist a usage row and run budget enforcement. Called exactly once
    /// per completed dispatch attempt; never fails the dispatch.
    pub async fn record(&self, row: UsageRow) {
        let cost = row.cost;
        let user = row.user_id.clone();

        if let Err(e) = self.store.insert_usage(row).await {
            warn!("usage row persist failed: {e}");
            self.emit(EventKind::LedgerFault {
                detail: format!("record: {e}"),
            });
        }

        // Budget math happens in memory regardless of persistence outcome,
        // so enforcement still sees the spend
        let (signals, snapshots) = {
            let mut book = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
            let signals = book.apply(cost, user.as_deref(), Local::now());
            let snapshots: Vec<_> = signals
                .iter()
                .map(|s| (s.scope.storage_key(), book.state_of(&s.scope)))
                .collect();
            (signals, snapshots)
        };

        for (signal, (scope_key, snapshot)) in signals.iter().zip(snapshots) {
            match signal.kind {
                BudgetSignalKind::Warning => {
                    debug!("budget warning for {}: {:.4}/{:.4}", signal.scope, signal.used, signal.limit);
                    self.emit(EventKind::BudgetWarning {
                        scope: signal.scope.clone(),
                        used: signal.used,
                        limit: signal.limit,
                    });
                }
                BudgetSignalKind::Exceeded => {
                    warn!("budget exceeded for {}: {:.4}/{:.4}", signal.scope, signal.used, signal.limit);
                    self.emit(EventKind::BudgetExceeded {
                        scope: signal.scope.clone(),
                        used: signal.used,
                        limit: signal.limit,
                    });
                }
            }
            if let Err(e) = self.store.insert_alert(signal.clone()).await {
                warn!("alert persist failed: {e}");
            }
            if let Some(state) = snapshot {
                if let Err(e) = self.store.save_budget(scope_key, state).await {
                    warn!("budget persist failed: {e}");
                }
            }
        }
    }

    /// Exceeded budget scope that blocks a new dispatch, if any
    pub fn exceeded_budget(&self, user: Option<&str>) -> Option<BudgetSignal> {
        let mut book = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        book.exceeded_scope(user, Local::now())
    }

    pub fn budget_status(&self) -> Vec<BudgetStatusView> {
        let book = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        book.status()
    }

    pub async fn usage_by_period(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageSummary, LedgerError> {
        self.store.usage_by_period(from, to).await
    }

    pub async fn provider_comparison(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProviderComparison>, LedgerError> {
        self.store.provider_comparison(from, to).await
    }

    /// Raw rows as a JSON array
    pub async fn export_json(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<String, LedgerError> {
        let rows = self.store.rows_between(from, to).await?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    /// Raw rows as CSV with a header line
    pub async fn export_csv(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<String, LedgerError> {
        let rows = self.store.rows_between(from, to).await?;
        let mut out = String::from(
            "id,timestamp,provider,model,user_id,input_tokens,output_tokens,reasoning_tokens,\
             cached_tokens,total_tokens,cost,latency_ms,success,cache_hit\n",
        );
        for row in rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
                row.id,
                row.timestamp.to_rfc3339(),
                csv_field(&row.provider),
                csv_field(&row.model),
                csv_field(row.user_id.as_deref().unwrap_or("")),
                row.input_tokens,
                row.output_tokens,
                row.reasoning_tokens,
                row.cached_input_tokens,
                row.total_tokens,
                row.cost,
                row.latency_ms,
                row.success,
                row.cache_hit,
            ));
        }
        Ok(out)
    }

    /// Delete rows older than the retention horizon
    pub async fn run_maintenance(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days as i64);
        match self.store.purge_before(cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    debug!("purged {purged} usage rows past retention");
                }
                purged
            }
            Err(e) => {
                warn!("ledger maintenance failed: {e}");
                self.emit(EventKind::LedgerFault {
                    detail: format!("maintenance: {e}"),
                });
                0
            }
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod ledger_tests;
