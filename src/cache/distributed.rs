//! Distributed cache tier
//!
//! Optional Redis tier shared by multiple switchboard processes. Entries
//! are JSON values keyed by the prompt key under a namespace prefix; the
//! TTL rides along with every write. The dispatcher never waits on this
//! tier for writes; the engine's write-behind worker owns that traffic.

use redis::AsyncCommands;
use std::time::Duration;

use super::{CacheError, CachedEntry};

const KEY_PREFIX: &str = "switchboard:cache:";

pub struct DistributedTier {
    manager: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl DistributedTier {
    pub async fn connect(endpoint: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(endpoint)?;
        let manager = client.get_tokio_connection_manager().await?;
        Ok(Self { manager, ttl })
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    pub async fn get(&self, key: &str) -> Result<Option<CachedEntry>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(Self::namespaced(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, entry: &CachedEntry) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(entry)?;
        let ttl_secs = self.ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(Self::namespaced(&entry.key), json, ttl_secs)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(Self::namespaced(key)).await?;
        Ok(())
    }

    /// Remove every key in our namespace. Collects matches first so the
    /// scan connection is free again before deleting.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}
