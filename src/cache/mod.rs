//! Response cache engine
//!
//! Three tiers consulted in order — in-memory LRU, durable SQLite,
//! optional distributed Redis — with an optional semantic-similarity
//! fallback over the durable tier. A hit in a slower tier is promoted into
//! every faster tier. Writes go through the memory and durable tiers on
//! the request path; distributed writes drain through a single in-order
//! worker so the request path never blocks on the network.
//!
//! Every tier failure is absorbed: a broken tier behaves as a miss, the
//! failure is logged and emitted as a `cache:error` event, and the dispatch
//! proceeds to the providers.

pub mod distributed;
pub mod durable;
pub mod fingerprint;
pub mod memory;
pub mod similarity;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::events::{EventKind, EventSink, SwitchboardEvent};

use distributed::DistributedTier;
use durable::DurableTier;
use fingerprint::PromptKey;
use memory::MemoryTier;

/// Cache subsystem errors; always absorbed before they reach a caller
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("durable cache error: {0}")]
    Durable(#[from] tokio_rusqlite::Error),

    #[error("distributed cache error: {0}")]
    Distributed(#[from] redis::RedisError),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tier a hit was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    Durable,
    Distributed,
}

/// A stored response with its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: String,
    /// Response payload, opaque to the cache
    pub payload: serde_json::Value,
    /// Provider that produced the payload
    pub provider: String,
    pub model: String,
    /// Retained for similarity search
    pub normalized_prompt: String,
    pub tokens: u32,
    /// Cost at time of write
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
}

impl CachedEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: String,
        payload: serde_json::Value,
        provider: String,
        model: String,
        normalized_prompt: String,
        tokens: u32,
        cost: f64,
        ttl: ChronoDuration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            payload,
            provider,
            model,
            normalized_prompt,
            tokens,
            cost,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_accessed: now,
        }
    }
}

/// Metadata recorded with a `put`
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    pub provider: String,
    pub model: String,
    pub normalized_prompt: String,
    pub tokens: u32,
    pub cost: f64,
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CachedEntry,
    pub tier: CacheTier,
    /// Present when the hit came from the semantic fallback
    pub similarity: Option<f64>,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub distributed_hits: u64,
    pub distributed_misses: u64,
    pub semantic_hits: u64,
    pub writes: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub avg_lookup_latency_ms: f64,
}

#[derive(Default)]
struct StatsInner {
    total_requests: AtomicU64,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    durable_hits: AtomicU64,
    durable_misses: AtomicU64,
    distributed_hits: AtomicU64,
    distributed_misses: AtomicU64,
    semantic_hits: AtomicU64,
    writes: AtomicU64,
    purged: AtomicU64,
    lookup_micros: AtomicU64,
    lookups: AtomicU64,
}

enum WriteBehind {
    Put(Box<CachedEntry>),
    Delete(String),
    Clear,
}

/// The three-tier cache engine
pub struct CacheEngine {
    memory: MemoryTier,
    durable: Option<DurableTier>,
    distributed: Option<Arc<DistributedTier>>,
    settings: CacheSettings,
    durable_ttl: ChronoDuration,
    stats: StatsInner,
    events: Arc<dyn EventSink>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteBehind>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    pub async fn new(
        settings: CacheSettings,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, CacheError> {
        let memory = MemoryTier::new(
            settings.memory.max_entries,
            Duration::from_millis(settings.memory.ttl_ms),
        );

        let durable = if settings.durable.enabled {
            Some(DurableTier::open(&settings.durable.path, settings.durable.max_entries).await?)
        } else {
            None
        };

        // An unreachable distributed endpoint must not prevent startup;
        // the tier is simply left out
        let distributed = if settings.distributed.enabled {
            let ttl = Duration::from_millis(settings.distributed.ttl_ms);
            match DistributedTier::connect(&settings.distributed.endpoint, ttl).await {
                Ok(tier) => Some(Arc::new(tier)),
                Err(e) => {
                    warn!("distributed cache unavailable, continuing without it: {e}");
                    None
                }
            }
        } else {
            None
        };

        let durable_ttl = ChronoDuration::milliseconds(settings.durable.ttl_ms as i64);

        let (write_tx, writer) = match &distributed {
            Some(tier) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = spawn_write_behind(Arc::clone(tier), rx, Arc::clone(&events));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        Ok(Self {
            memory,
            durable,
            distributed,
            settings,
            durable_ttl,
            stats: StatsInner::default(),
            events,
            write_tx: Mutex::new(write_tx),
            writer: Mutex::new(writer),
        })
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(SwitchboardEvent::now(kind));
    }

    fn emit_fault(&self, context: &str, error: &CacheError) {
        warn!("cache {context} failed: {error}");
        self.emit(EventKind::CacheFault {
            detail: format!("{context}: {error}"),
        });
    }

    /// Look up a prompt key across the tiers, falling back to the semantic
    /// scan when enabled. `query_prompt` is the request's normalized prompt
    /// text, used only by the semantic fallback.
    pub async fn get(
        &self,
        key: &PromptKey,
        query_prompt: &str,
        provider_hint: Option<&str>,
        model_hint: Option<&str>,
    ) -> Option<CacheHit> {
        let started = Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let outcome = self
            .lookup(key, query_prompt, provider_hint, model_hint)
            .await;

        let elapsed = started.elapsed().as_micros() as u64;
        self.stats.lookup_micros.fetch_add(elapsed, Ordering::Relaxed);
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        match &outcome {
            Some(hit) => match hit.similarity {
                Some(similarity) => self.emit(EventKind::CacheSemanticHit {
                    key: hit.entry.key.clone(),
                    similarity,
                }),
                None => self.emit(EventKind::CacheHit {
                    key: key.as_str().to_string(),
                    tier: hit.tier,
                }),
            },
            None => self.emit(EventKind::CacheMiss {
                key: key.as_str().to_string(),
            }),
        }

        outcome
    }

    async fn lookup(
        &self,
        key: &PromptKey,
        query_prompt: &str,
        provider_hint: Option<&str>,
        model_hint: Option<&str>,
    ) -> Option<CacheHit> {
        if let Some(entry) = self.memory.get(key.as_str()) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(CacheHit {
                entry,
                tier: CacheTier::Memory,
                similarity: None,
            });
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(durable) = &self.durable {
            match durable.get(key.as_str()).await {
                Ok(Some(entry)) => {
                    self.stats.durable_hits.fetch_add(1, Ordering::Relaxed);
                    self.memory.put(entry.clone());
                    return Some(CacheHit {
                        entry,
                        tier: CacheTier::Durable,
                        similarity: None,
                    });
                }
                Ok(None) => {}
                Err(e) => self.emit_fault("durable get", &e),
            }
            self.stats.durable_misses.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(distributed) = &self.distributed {
            match distributed.get(key.as_str()).await {
                Ok(Some(entry)) => {
                    self.stats.distributed_hits.fetch_add(1, Ordering::Relaxed);
                    // Promote synchronously into every faster tier
                    if let Some(durable) = &self.durable {
                        if let Err(e) = durable.put(entry.clone()).await {
                            self.emit_fault("durable promote", &e);
                        }
                    }
                    self.memory.put(entry.clone());
                    return Some(CacheHit {
                        entry,
                        tier: CacheTier::Distributed,
                        similarity: None,
                    });
                }
                Ok(None) => {}
                Err(e) => self.emit_fault("distributed get", &e),
            }
            self.stats.distributed_misses.fetch_add(1, Ordering::Relaxed);
        }

        if self.settings.similarity.enabled {
            return self
                .semantic_lookup(query_prompt, provider_hint, model_hint)
                .await;
        }

        None
    }

    /// Bounded scan of the durable tier for the closest stored prompt.
    /// The best score must strictly exceed the threshold.
    async fn semantic_lookup(
        &self,
        query_prompt: &str,
        provider_hint: Option<&str>,
        model_hint: Option<&str>,
    ) -> Option<CacheHit> {
        let durable = self.durable.as_ref()?;
        if query_prompt.is_empty() {
            return None;
        }

        let candidates = match durable
            .scan_candidates(provider_hint, self.settings.similarity.scan_limit)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                self.emit_fault("semantic scan", &e);
                return None;
            }
        };

        let algorithm = self.settings.similarity.algorithm;
        let best = candidates
            .iter()
            .filter(|c| model_hint.map_or(true, |m| c.model == m))
            .map(|c| {
                (
                    c,
                    similarity::score(algorithm, query_prompt, &c.normalized_prompt),
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        let (candidate, score) = best;
        if score <= self.settings.similarity.threshold {
            debug!(
                "best semantic candidate scored {score:.4}, below threshold {}",
                self.settings.similarity.threshold
            );
            return None;
        }

        match durable.get(&candidate.key).await {
            Ok(Some(entry)) => {
                self.stats.semantic_hits.fetch_add(1, Ordering::Relaxed);
                self.memory.put(entry.clone());
                Some(CacheHit {
                    entry,
                    tier: CacheTier::Durable,
                    similarity: Some(score),
                })
            }
            Ok(None) => None,
            Err(e) => {
                self.emit_fault("semantic load", &e);
                None
            }
        }
    }

    /// Write-through: memory and durable on the request path, distributed
    /// through the write-behind worker
    pub async fn put(&self, key: &PromptKey, payload: serde_json::Value, metadata: EntryMetadata) {
        let entry = CachedEntry::new(
            key.as_str().to_string(),
            payload,
            metadata.provider,
            metadata.model,
            metadata.normalized_prompt,
            metadata.tokens,
            metadata.cost,
            self.durable_ttl,
        );

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.memory.put(entry.clone());

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(entry.clone()).await {
                self.emit_fault("durable put", &e);
            }
        }

        self.enqueue(WriteBehind::Put(Box::new(entry)));
    }

    pub async fn delete(&self, key: &PromptKey) {
        self.memory.delete(key.as_str());
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.delete(key.as_str()).await {
                self.emit_fault("durable delete", &e);
            }
        }
        self.enqueue(WriteBehind::Delete(key.as_str().to_string()));
    }

    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.clear().await {
                self.emit_fault("durable clear", &e);
            }
        }
        self.enqueue(WriteBehind::Clear);
    }

    fn enqueue(&self, op: WriteBehind) {
        let tx = self.write_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = tx.as_ref() {
            // Worker gone means the engine is closing; drop the write
            let _ = tx.send(op);
        }
    }

    /// Purge expired durable entries; returns the number removed
    pub async fn run_maintenance(&self) -> usize {
        let Some(durable) = &self.durable else {
            return 0;
        };
        match durable.purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    debug!("purged {purged} expired cache entries");
                }
                self.stats.purged.fetch_add(purged as u64, Ordering::Relaxed);
                purged
            }
            Err(e) => {
                self.emit_fault("maintenance", &e);
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let total_requests = self.stats.total_requests.load(Ordering::Relaxed);
        let memory_hits = self.stats.memory_hits.load(Ordering::Relaxed);
        let durable_hits = self.stats.durable_hits.load(Ordering::Relaxed);
        let distributed_hits = self.stats.distributed_hits.load(Ordering::Relaxed);
        let semantic_hits = self.stats.semantic_hits.load(Ordering::Relaxed);
        let hits = memory_hits + durable_hits + distributed_hits + semantic_hits;
        let lookups = self.stats.lookups.load(Ordering::Relaxed);

        CacheStats {
            total_requests,
            memory_hits,
            memory_misses: self.stats.memory_misses.load(Ordering::Relaxed),
            durable_hits,
            durable_misses: self.stats.durable_misses.load(Ordering::Relaxed),
            distributed_hits,
            distributed_misses: self.stats.distributed_misses.load(Ordering::Relaxed),
            semantic_hits,
            writes: self.stats.writes.load(Ordering::Relaxed),
            evictions: self.memory.evictions() + self.stats.purged.load(Ordering::Relaxed),
            hit_rate: if total_requests > 0 {
                hits as f64 / total_requests as f64
            } else {
                0.0
            },
            avg_lookup_latency_ms: if lookups > 0 {
                self.stats.lookup_micros.load(Ordering::Relaxed) as f64 / lookups as f64 / 1000.0
            } else {
                0.0
            },
        }
    }

    /// Drain the write-behind worker and stop it
    pub async fn close(&self) {
        let tx = self
            .write_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn spawn_write_behind(
    tier: Arc<DistributedTier>,
    mut rx: mpsc::UnboundedReceiver<WriteBehind>,
    events: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let result = match &op {
                WriteBehind::Put(entry) => tier.put(entry).await,
                WriteBehind::Delete(key) => tier.delete(key).await,
                WriteBehind::Clear => tier.clear().await,
            };
            if let Err(e) = result {
                warn!("distributed cache write-behind failed: {e}");
                events.emit(SwitchboardEvent::now(EventKind::CacheFault {
                    detail: format!("write-behind: {e}"),
                }));
            }
        }
    })
}
