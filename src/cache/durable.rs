//! Durable cache tier
//!
//! Single-file SQLite store with indexes on expiry, provider, and the
//! normalized prompt text. All access goes through `tokio-rusqlite`, which
//! serializes statements on a dedicated connection thread. Timestamps are
//! stored as unix milliseconds.

use rusqlite::params;
use tokio_rusqlite::Connection;

use super::{CacheError, CachedEntry};

fn to_millis(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    normalized_prompt TEXT NOT NULL,
    tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_provider ON cache(provider);
CREATE INDEX IF NOT EXISTS idx_cache_normalized_prompt ON cache(normalized_prompt);
";

/// Row subset returned by the semantic candidate scan
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub key: String,
    pub model: String,
    pub normalized_prompt: String,
}

pub struct DurableTier {
    conn: Connection,
    max_entries: usize,
}

impl DurableTier {
    pub async fn open(path: &str, max_entries: usize) -> Result<Self, CacheError> {
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, max_entries })
    }

    /// In-memory store, used by tests
    #[cfg(test)]
    pub async fn open_in_memory(max_entries: usize) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, max_entries })
    }

    /// Fetch a non-expired entry and bump its access bookkeeping. An
    /// expired entry is deleted and reported as absent.
    pub async fn get(&self, key: &str) -> Result<Option<CachedEntry>, CacheError> {
        let key = key.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let now = to_millis(chrono::Utc::now());
                let mut stmt = conn.prepare(
                    "SELECT key, value, provider, model, normalized_prompt, tokens, cost,
                            created_at, expires_at, access_count, last_accessed
                     FROM cache WHERE key = ?1",
                )?;
                let mut rows = stmt.query(params![key])?;
                let row = match rows.next()? {
                    Some(row) => row,
                    None => return Ok(None),
                };
                let entry = row_to_entry(row)?;
                drop(rows);
                drop(stmt);

                if to_millis(entry.expires_at) <= now {
                    conn.execute("DELETE FROM cache WHERE key = ?1", params![entry.key])?;
                    return Ok(None);
                }

                conn.execute(
                    "UPDATE cache SET access_count = access_count + 1, last_accessed = ?1
                     WHERE key = ?2",
                    params![now, entry.key],
                )?;
                Ok(Some(entry))
            })
            .await?;
        Ok(entry)
    }

    /// Insert or replace an entry, then enforce the capacity bound by
    /// dropping the least recently accessed overflow
    pub async fn put(&self, entry: CachedEntry) -> Result<(), CacheError> {
        let max_entries = self.max_entries;
        let value = serde_json::to_string(&entry.payload)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO cache
                     (key, value, provider, model, normalized_prompt, tokens, cost,
                      created_at, expires_at, access_count, last_accessed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        entry.key,
                        value,
                        entry.provider,
                        entry.model,
                        entry.normalized_prompt,
                        entry.tokens,
                        entry.cost,
                        to_millis(entry.created_at),
                        to_millis(entry.expires_at),
                        entry.access_count,
                        to_millis(entry.last_accessed),
                    ],
                )?;
                conn.execute(
                    "DELETE FROM cache WHERE key IN
                     (SELECT key FROM cache ORDER BY last_accessed DESC LIMIT -1 OFFSET ?1)",
                    params![max_entries as i64],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM cache", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count as usize)
    }

    /// Candidates for the semantic scan: non-expired, optionally filtered
    /// to one provider, most recently accessed first so the scan window is
    /// reproducible
    pub async fn scan_candidates(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScanCandidate>, CacheError> {
        let provider = provider.map(|p| p.to_string());
        let candidates = self
            .conn
            .call(move |conn| {
                let now = to_millis(chrono::Utc::now());
                let map_row = |row: &rusqlite::Row<'_>| {
                    Ok(ScanCandidate {
                        key: row.get(0)?,
                        model: row.get(1)?,
                        normalized_prompt: row.get(2)?,
                    })
                };
                let mut results = Vec::new();
                match provider {
                    Some(provider) => {
                        let mut stmt = conn.prepare(
                            "SELECT key, model, normalized_prompt FROM cache
                             WHERE expires_at > ?1 AND provider = ?2
                             ORDER BY last_accessed DESC LIMIT ?3",
                        )?;
                        let rows = stmt.query_map(params![now, provider, limit as i64], map_row)?;
                        for row in rows {
                            results.push(row?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT key, model, normalized_prompt FROM cache
                             WHERE expires_at > ?1
                             ORDER BY last_accessed DESC LIMIT ?2",
                        )?;
                        let rows = stmt.query_map(params![now, limit as i64], map_row)?;
                        for row in rows {
                            results.push(row?);
                        }
                    }
                }
                Ok(results)
            })
            .await?;
        Ok(candidates)
    }

    /// Drop everything past its expiry; returns the number of rows removed
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        let purged = self
            .conn
            .call(|conn| {
                let now = to_millis(chrono::Utc::now());
                let purged = conn.execute("DELETE FROM cache WHERE expires_at <= ?1", params![now])?;
                Ok(purged)
            })
            .await?;
        Ok(purged)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedEntry> {
    let value: String = row.get(1)?;
    let payload = serde_json::from_str(&value).unwrap_or(serde_json::Value::Null);
    Ok(CachedEntry {
        key: row.get(0)?,
        payload,
        provider: row.get(2)?,
        model: row.get(3)?,
        normalized_prompt: row.get(4)?,
        tokens: row.get(5)?,
        cost: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        expires_at: from_millis(row.get(8)?),
        access_count: row.get(9)?,
        last_accessed: from_millis(row.get(10)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(key: &str, provider: &str, prompt: &str) -> CachedEntry {
        CachedEntry::new(
            key.to_string(),
            serde_json::json!({"text": "cached"}),
            provider.into(),
            "m1".into(),
            prompt.into(),
            12,
            0.002,
            ChronoDuration::days(7),
        )
    }

    #[tokio::test]
    async fn put_get_round_trips_and_bumps_access() {
        let tier = DurableTier::open_in_memory(100).await.unwrap();
        tier.put(entry("k1", "provA", "hello world")).await.unwrap();

        let first = tier.get("k1").await.unwrap().unwrap();
        assert_eq!(first.payload["text"], "cached");
        assert_eq!(first.provider, "provA");

        let second = tier.get("k1").await.unwrap().unwrap();
        // The bump lands after the read, so the second read sees one access
        assert_eq!(second.access_count, first.access_count + 1);
    }

    #[tokio::test]
    async fn expired_entry_is_deleted_on_get() {
        let tier = DurableTier::open_in_memory(100).await.unwrap();
        let mut stale = entry("k1", "provA", "hello");
        stale.expires_at = chrono::Utc::now() - ChronoDuration::seconds(1);
        tier.put(stale).await.unwrap();

        assert!(tier.get("k1").await.unwrap().is_none());
        assert_eq!(tier.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capacity_bound_drops_least_recently_accessed() {
        let tier = DurableTier::open_in_memory(2).await.unwrap();
        tier.put(entry("k1", "provA", "one")).await.unwrap();
        tier.put(entry("k2", "provA", "two")).await.unwrap();
        tier.get("k1").await.unwrap();
        tier.put(entry("k3", "provA", "three")).await.unwrap();

        assert_eq!(tier.len().await.unwrap(), 2);
        assert!(tier.get("k2").await.unwrap().is_none());
        assert!(tier.get("k3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scan_filters_by_provider_and_orders_by_recency() {
        let tier = DurableTier::open_in_memory(100).await.unwrap();
        tier.put(entry("k1", "provA", "first prompt")).await.unwrap();
        tier.put(entry("k2", "provB", "second prompt")).await.unwrap();
        tier.put(entry("k3", "provA", "third prompt")).await.unwrap();
        // Make k1 the most recently accessed provA entry
        tier.get("k1").await.unwrap();

        let candidates = tier.scan_candidates(Some("provA"), 10).await.unwrap();
        let keys: Vec<&str> = candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k3"]);

        let all = tier.scan_candidates(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_rows() {
        let tier = DurableTier::open_in_memory(100).await.unwrap();
        tier.put(entry("fresh", "provA", "fresh")).await.unwrap();
        let mut stale = entry("stale", "provA", "stale");
        stale.expires_at = chrono::Utc::now() - ChronoDuration::seconds(1);
        tier.put(stale).await.unwrap();

        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert_eq!(tier.len().await.unwrap(), 1);
    }
}
