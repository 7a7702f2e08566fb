//! Provider selection strategies
//!
//! Given the eligible candidates for a request, each strategy orders them
//! into an attempt list: the first entry is the primary pick, the rest form
//! the failover tail in strategy order.

use rand::Rng;
use std::cmp::Ordering;

use crate::config::RoutingStrategy;

/// Snapshot of one eligible provider for a single selection pass
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: String,
    /// Model this provider would serve for the request
    pub model: String,
    pub weight: f64,
    pub latency_ema_ms: f64,
    pub success_rate: f64,
    /// Estimated cost for the request's token budget on this provider
    pub estimated_cost: f64,
    /// Requested capabilities the provider declares beyond the required set
    pub capability_matches: u32,
}

fn by_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Order the eligible candidates into an attempt list
pub fn order_attempts(
    strategy: RoutingStrategy,
    mut candidates: Vec<Candidate>,
    round_robin_tick: u64,
) -> Vec<Candidate> {
    if candidates.len() <= 1 {
        return candidates;
    }

    match strategy {
        RoutingStrategy::CostBased => {
            candidates.sort_by(|a, b| {
                by_f64(a.estimated_cost, b.estimated_cost)
                    .then_with(|| by_f64(a.latency_ema_ms, b.latency_ema_ms))
            });
            candidates
        }
        RoutingStrategy::LatencyBased => {
            candidates.sort_by(|a, b| {
                by_f64(a.latency_ema_ms, b.latency_ema_ms)
                    .then_with(|| by_f64(b.success_rate, a.success_rate))
            });
            candidates
        }
        RoutingStrategy::QualityBased => {
            let score = |c: &Candidate| c.success_rate + 0.05 * c.capability_matches as f64;
            candidates.sort_by(|a, b| {
                by_f64(score(b), score(a)).then_with(|| by_f64(a.latency_ema_ms, b.latency_ema_ms))
            });
            candidates
        }
        RoutingStrategy::RoundRobin => {
            // Stable base order so the counter walks a fixed ring
            candidates.sort_by(|a, b| a.provider.cmp(&b.provider));
            let offset = (round_robin_tick % candidates.len() as u64) as usize;
            candidates.rotate_left(offset);
            candidates
        }
        RoutingStrategy::Weighted => {
            let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
            let first = if total > 0.0 {
                let mut roll = rand::thread_rng().gen_range(0.0..total);
                let mut picked = 0;
                for (i, candidate) in candidates.iter().enumerate() {
                    roll -= candidate.weight.max(0.0);
                    if roll < 0.0 {
                        picked = i;
                        break;
                    }
                }
                picked
            } else {
                0
            };
            let head = candidates.remove(first);
            candidates.sort_by(|a, b| by_f64(b.weight, a.weight));
            candidates.insert(0, head);
            candidates
        }
    }
}
