//! Per-provider concurrency limiter
//!
//! Admission and the in-flight increment are one atomic compare-and-swap;
//! the returned permit decrements exactly once on drop, whatever path the
//! dispatch takes afterwards.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct ProviderLoad {
    in_flight: AtomicU32,
    max_concurrent: u32,
}

/// RAII admission token
pub struct LoadPermit {
    load: Arc<ProviderLoad>,
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.load.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct LoadLimiter {
    loads: DashMap<String, Arc<ProviderLoad>>,
}

impl LoadLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: impl Into<String>, max_concurrent: u32) {
        self.loads.insert(
            provider.into(),
            Arc::new(ProviderLoad {
                in_flight: AtomicU32::new(0),
                max_concurrent: max_concurrent.max(1),
            }),
        );
    }

    /// Admit a request if the provider has headroom
    pub fn try_acquire(&self, provider: &str) -> Option<LoadPermit> {
        let load = Arc::clone(self.loads.get(provider)?.value());
        load.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < load.max_concurrent).then_some(current + 1)
            })
            .ok()?;
        Some(LoadPermit { load })
    }

    /// Whether an admission would currently succeed
    pub fn has_headroom(&self, provider: &str) -> bool {
        self.loads
            .get(provider)
            .map(|load| load.in_flight.load(Ordering::Acquire) < load.max_concurrent)
            .unwrap_or(false)
    }

    pub fn in_flight(&self, provider: &str) -> u32 {
        self.loads
            .get(provider)
            .map(|load| load.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
