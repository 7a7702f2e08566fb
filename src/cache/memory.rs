//! In-memory fast tier
//!
//! Bounded LRU with lazy TTL: an entry past its deadline is treated as
//! absent on access and evicted on the spot. The mutex is never held across
//! an await point, so plain `std::sync::Mutex` is sufficient.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::CachedEntry;

struct MemorySlot {
    entry: CachedEntry,
    inserted_at: Instant,
}

pub struct MemoryTier {
    slots: Mutex<LruCache<String, MemorySlot>>,
    ttl: Duration,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            ttl,
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an entry, bumping recency and access bookkeeping. Expired
    /// entries are removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<CachedEntry> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match slots.get(key) {
            Some(slot) => {
                slot.inserted_at.elapsed() > self.ttl || slot.entry.expires_at <= Utc::now()
            }
            None => return None,
        };

        if expired {
            slots.pop(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slot = slots.get_mut(key)?;
        slot.entry.access_count += 1;
        slot.entry.last_accessed = Utc::now();
        Some(slot.entry.clone())
    }

    pub fn put(&self, entry: CachedEntry) {
        let key = entry.key.clone();
        let slot = MemorySlot {
            entry,
            inserted_at: Instant::now(),
        };
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((evicted_key, _)) = slots.push(key.clone(), slot) {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn delete(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.pop(key);
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenUsage;
    use chrono::Duration as ChronoDuration;

    fn entry(key: &str) -> CachedEntry {
        CachedEntry::new(
            key.to_string(),
            serde_json::json!({"text": "hi"}),
            "provA".into(),
            "m1".into(),
            "hello".into(),
            TokenUsage::new(5, 2).total(),
            0.001,
            ChronoDuration::days(7),
        )
    }

    #[test]
    fn put_then_get_round_trips() {
        let tier = MemoryTier::new(10, Duration::from_secs(60));
        tier.put(entry("k1"));
        let hit = tier.get("k1").unwrap();
        assert_eq!(hit.key, "k1");
        assert_eq!(hit.access_count, 1);
    }

    #[test]
    fn expired_entry_is_absent_and_evicted() {
        let tier = MemoryTier::new(10, Duration::from_millis(0));
        tier.put(entry("k1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(tier.get("k1").is_none());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.evictions(), 1);
    }

    #[test]
    fn global_expiry_also_evicts() {
        let tier = MemoryTier::new(10, Duration::from_secs(60));
        let mut stale = entry("k1");
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        tier.put(stale);
        assert!(tier.get("k1").is_none());
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn capacity_eviction_drops_least_recently_used() {
        let tier = MemoryTier::new(2, Duration::from_secs(60));
        tier.put(entry("k1"));
        tier.put(entry("k2"));
        // Touch k1 so k2 is the LRU victim
        tier.get("k1").unwrap();
        tier.put(entry("k3"));
        assert!(tier.get("k1").is_some());
        assert!(tier.get("k2").is_none());
        assert!(tier.get("k3").is_some());
        assert_eq!(tier.evictions(), 1);
    }
}
