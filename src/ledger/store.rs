//! Ledger persistence
//!
//! Append-only `usage` rows plus `budgets` and `alerts` tables in one
//! SQLite file. Aggregation queries touch only indexed columns. Timestamps
//! are unix milliseconds.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::budget::{BudgetSignal, BudgetSignalKind, BudgetState};
use super::{LedgerError, ProviderComparison, UsageSummary, UsageTotals};
use crate::types::UsageRow;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    user_id TEXT,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    reasoning_tokens INTEGER NOT NULL,
    cached_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    latency INTEGER NOT NULL,
    success INTEGER NOT NULL,
    cache_hit INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage(timestamp);
CREATE INDEX IF NOT EXISTS idx_usage_provider ON usage(provider);
CREATE INDEX IF NOT EXISTS idx_usage_model ON usage(model);
CREATE INDEX IF NOT EXISTS idx_usage_user_id ON usage(user_id);

CREATE TABLE IF NOT EXISTS budgets (
    scope TEXT PRIMARY KEY,
    period TEXT NOT NULL,
    limit_amount REAL,
    used REAL NOT NULL,
    exceeded INTEGER NOT NULL,
    alerted INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    scope TEXT NOT NULL,
    used REAL NOT NULL,
    limit_amount REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp);
";

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn insert_usage(&self, row: UsageRow) -> Result<(), LedgerError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO usage
                     (id, timestamp, provider, model, user_id, input_tokens, output_tokens,
                      reasoning_tokens, cached_tokens, total_tokens, cost, latency, success,
                      cache_hit)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        row.id.to_string(),
                        to_millis(row.timestamp),
                        row.provider,
                        row.model,
                        row.user_id,
                        row.input_tokens,
                        row.output_tokens,
                        row.reasoning_tokens,
                        row.cached_input_tokens,
                        row.total_tokens,
                        row.cost,
                        row.latency_ms as i64,
                        row.success as i64,
                        row.cache_hit as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Raw rows in a time range, oldest first
    pub async fn rows_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRow>, LedgerError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, provider, model, user_id, input_tokens, output_tokens,
                            reasoning_tokens, cached_tokens, total_tokens, cost, latency, success,
                            cache_hit
                     FROM usage WHERE timestamp >= ?1 AND timestamp < ?2
                     ORDER BY timestamp ASC",
                )?;
                let mapped = stmt.query_map(params![to_millis(from), to_millis(to)], |row| {
                    Ok(UsageRow {
                        id: row
                            .get::<_, String>(0)?
                            .parse::<Uuid>()
                            .unwrap_or_else(|_| Uuid::nil()),
                        timestamp: from_millis(row.get(1)?),
                        provider: row.get(2)?,
                        model: row.get(3)?,
                        user_id: row.get(4)?,
                        input_tokens: row.get(5)?,
                        output_tokens: row.get(6)?,
                        reasoning_tokens: row.get(7)?,
                        cached_input_tokens: row.get(8)?,
                        total_tokens: row.get(9)?,
                        cost: row.get(10)?,
                        latency_ms: row.get::<_, i64>(11)? as u64,
                        success: row.get::<_, i64>(12)? != 0,
                        cache_hit: row.get::<_, i64>(13)? != 0,
                    })
                })?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row?);
                }
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn usage_by_period(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageSummary, LedgerError> {
        let summary = self
            .conn
            .call(move |conn| {
                let (from, to) = (to_millis(from), to_millis(to));

                let total = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0),
                            COALESCE(SUM(output_tokens), 0), COALESCE(SUM(total_tokens), 0),
                            COALESCE(SUM(cost), 0.0), COALESCE(AVG(latency), 0.0)
                     FROM usage WHERE timestamp >= ?1 AND timestamp < ?2",
                    params![from, to],
                    totals_from_row,
                )?;

                let grouped = |conn: &rusqlite::Connection,
                               column: &str|
                 -> rusqlite::Result<Vec<(String, UsageTotals)>> {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {column}, COUNT(*), COALESCE(SUM(input_tokens), 0),
                                COALESCE(SUM(output_tokens), 0), COALESCE(SUM(total_tokens), 0),
                                COALESCE(SUM(cost), 0.0), COALESCE(AVG(latency), 0.0)
                         FROM usage
                         WHERE timestamp >= ?1 AND timestamp < ?2 AND {column} IS NOT NULL
                         GROUP BY {column} ORDER BY SUM(cost) DESC"
                    ))?;
                    let mapped = stmt.query_map(params![from, to], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            UsageTotals {
                                requests: row.get::<_, i64>(1)? as u64,
                                input_tokens: row.get::<_, i64>(2)? as u64,
                                output_tokens: row.get::<_, i64>(3)? as u64,
                                total_tokens: row.get::<_, i64>(4)? as u64,
                                cost: row.get(5)?,
                                avg_latency_ms: row.get(6)?,
                            },
                        ))
                    })?;
                    mapped.collect()
                };

                Ok(UsageSummary {
                    total,
                    by_provider: grouped(conn, "provider")?,
                    by_model: grouped(conn, "model")?,
                    by_user: grouped(conn, "user_id")?,
                })
            })
            .await?;
        Ok(summary)
    }

    pub async fn provider_comparison(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProviderComparison>, LedgerError> {
        let comparison = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, COUNT(*), AVG(success), COALESCE(AVG(latency), 0.0),
                            COALESCE(SUM(cost), 0.0), COALESCE(SUM(total_tokens), 0)
                     FROM usage WHERE timestamp >= ?1 AND timestamp < ?2
                     GROUP BY provider ORDER BY SUM(cost) DESC",
                )?;
                let mapped =
                    stmt.query_map(params![to_millis(from), to_millis(to)], |row| {
                        let requests = row.get::<_, i64>(1)? as u64;
                        let total_cost: f64 = row.get(4)?;
                        Ok(ProviderComparison {
                            provider: row.get(0)?,
                            requests,
                            success_rate: row.get::<_, f64>(2)?,
                            avg_latency_ms: row.get(3)?,
                            total_cost,
                            total_tokens: row.get::<_, i64>(5)? as u64,
                            cost_per_request: if requests > 0 {
                                total_cost / requests as f64
                            } else {
                                0.0
                            },
                        })
                    })?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row?);
                }
                Ok(rows)
            })
            .await?;
        Ok(comparison)
    }

    pub async fn save_budget(&self, scope_key: String, state: BudgetState) -> Result<(), LedgerError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO budgets (scope, period, limit_amount, used, exceeded, alerted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        scope_key,
                        state.period,
                        state.limit,
                        state.used,
                        state.exceeded as i64,
                        state.alerted as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_budgets(&self) -> Result<Vec<(String, BudgetState)>, LedgerError> {
        let budgets = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT scope, period, limit_amount, used, exceeded, alerted FROM budgets",
                )?;
                let mapped = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        BudgetState {
                            period: row.get(1)?,
                            limit: row.get(2)?,
                            used: row.get(3)?,
                            exceeded: row.get::<_, i64>(4)? != 0,
                            alerted: row.get::<_, i64>(5)? != 0,
                        },
                    ))
                })?;
                let mut budgets = Vec::new();
                for budget in mapped {
                    budgets.push(budget?);
                }
                Ok(budgets)
            })
            .await?;
        Ok(budgets)
    }

    pub async fn insert_alert(&self, signal: BudgetSignal) -> Result<(), LedgerError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO alerts (id, timestamp, kind, scope, used, limit_amount)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        to_millis(Utc::now()),
                        match signal.kind {
                            BudgetSignalKind::Warning => "budget-warning",
                            BudgetSignalKind::Exceeded => "budget-exceeded",
                        },
                        signal.scope.storage_key(),
                        signal.used,
                        signal.limit,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Delete usage rows older than the cutoff; returns the count removed
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let purged = self
            .conn
            .call(move |conn| {
                let purged = conn.execute(
                    "DELETE FROM usage WHERE timestamp < ?1",
                    params![to_millis(cutoff)],
                )?;
                Ok(purged)
            })
            .await?;
        Ok(purged)
    }
}

fn totals_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageTotals> {
    Ok(UsageTotals {
        requests: row.get::<_, i64>(0)? as u64,
        input_tokens: row.get::<_, i64>(1)? as u64,
        output_tokens: row.get::<_, i64>(2)? as u64,
        total_tokens: row.get::<_, i64>(3)? as u64,
        cost: row.get(4)?,
        avg_latency_ms: row.get(5)?,
    })
}
