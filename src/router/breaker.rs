//! Per-provider circuit breaker
//!
//! Closed admits everything and counts consecutive failures; Open rejects
//! until the open timeout has elapsed since the last failure; HalfOpen
//! admits a bounded number of probes and closes again after enough
//! consecutive successes. The current state is published through an atomic
//! so readers never take the transition lock, and the lock itself is never
//! held across an await point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// State change produced by an admission or a recorded outcome; the
/// dispatcher turns these into circuit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened { consecutive_failures: u32 },
    HalfOpened,
    Closed,
}

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `probe` is set for half-open admissions and must be handed back to
    /// the matching `on_*` call
    Admitted { probe: bool },
    Rejected,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub half_open_probes: u32,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_probes: u32,
}

pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    published: AtomicU8,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            published: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                last_failure_at: None,
                half_open_probes: 0,
            }),
        }
    }

    /// Lock-free view of the current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.published.load(Ordering::Acquire))
    }

    fn publish(&self, state: CircuitState) {
        self.published.store(state as u8, Ordering::Release);
    }

    /// Whether an admission attempt would currently succeed, without
    /// consuming a probe slot or transitioning. Used for eligibility
    /// filtering during selection.
    pub fn is_admitting(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure
                .map(|t| t.elapsed() >= self.settings.open_timeout())
                .unwrap_or(true),
            CircuitState::HalfOpen => inner.half_open_probes < self.settings.half_open_probes,
        }
    }

    /// Ask to admit one request. An `Open` circuit whose timeout has
    /// elapsed flips to `HalfOpen` on this first admission attempt.
    pub fn try_acquire(&self) -> (Admission, Option<CircuitTransition>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => (Admission::Admitted { probe: false }, None),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.settings.open_timeout())
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_probes = 1;
                    self.publish(CircuitState::HalfOpen);
                    (
                        Admission::Admitted { probe: true },
                        Some(CircuitTransition::HalfOpened),
                    )
                } else {
                    (Admission::Rejected, None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.settings.half_open_probes {
                    inner.half_open_probes += 1;
                    (Admission::Admitted { probe: true }, None)
                } else {
                    (Admission::Rejected, None)
                }
            }
        }
    }

    pub fn on_success(&self, probe: bool) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                if probe {
                    inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                }
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.half_open_probes = 0;
                    self.publish(CircuitState::Closed);
                    Some(CircuitTransition::Closed)
                } else {
                    None
                }
            }
            // A success landing after another probe already re-opened the
            // circuit changes nothing
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&self, probe: bool) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    self.publish(CircuitState::Open);
                    Some(CircuitTransition::Opened {
                        consecutive_failures: inner.consecutive_failures,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if probe {
                    inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                }
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                self.publish(CircuitState::Open);
                Some(CircuitTransition::Opened {
                    consecutive_failures: inner.consecutive_failures,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// A cancelled attempt releases its probe slot without counting either
    /// way
    pub fn on_cancelled(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            half_open_probes: inner.half_open_probes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(open_timeout_ms: u64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms,
            half_open_probes: 3,
        }
    }

    fn assert_admitted(breaker: &CircuitBreaker) -> bool {
        match breaker.try_acquire().0 {
            Admission::Admitted { probe } => probe,
            Admission::Rejected => panic!("expected admission"),
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(settings(60_000));
        for _ in 0..4 {
            assert!(breaker.on_failure(false).is_none());
        }
        let transition = breaker.on_failure(false).unwrap();
        assert_eq!(
            transition,
            CircuitTransition::Opened {
                consecutive_failures: 5
            }
        );
        assert_eq!(breaker.state(), CircuitState::Open);
        // Open rejects without touching the adapter
        assert_eq!(breaker.try_acquire().0, Admission::Rejected);
    }

    #[test]
    fn success_resets_the_failure_count_in_closed() {
        let breaker = CircuitBreaker::new(settings(60_000));
        for _ in 0..4 {
            breaker.on_failure(false);
        }
        breaker.on_success(false);
        for _ in 0..4 {
            assert!(breaker.on_failure(false).is_none());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_flips_to_half_open_after_the_timeout() {
        let breaker = CircuitBreaker::new(settings(0));
        for _ in 0..5 {
            breaker.on_failure(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let (admission, transition) = breaker.try_acquire();
        assert_eq!(admission, Admission::Admitted { probe: true });
        assert_eq!(transition, Some(CircuitTransition::HalfOpened));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_caps_concurrent_probes() {
        let breaker = CircuitBreaker::new(settings(0));
        for _ in 0..5 {
            breaker.on_failure(false);
        }
        // First admission transitions, two more fill the probe cap of 3
        assert!(assert_admitted(&breaker));
        assert!(assert_admitted(&breaker));
        assert!(assert_admitted(&breaker));
        assert_eq!(breaker.try_acquire().0, Admission::Rejected);

        // Releasing one probe frees one slot
        breaker.on_cancelled(true);
        assert!(assert_admitted(&breaker));
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let breaker = CircuitBreaker::new(settings(0));
        for _ in 0..5 {
            breaker.on_failure(false);
        }
        assert!(assert_admitted(&breaker));
        assert!(breaker.on_success(true).is_none());
        assert!(assert_admitted(&breaker));
        assert_eq!(breaker.on_success(true), Some(CircuitTransition::Closed));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_successes, 0);
    }

    #[test]
    fn any_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(settings(60_000));
        {
            let mut inner = breaker.inner.lock().unwrap();
            inner.state = CircuitState::HalfOpen;
            inner.half_open_probes = 1;
        }
        breaker.publish(CircuitState::HalfOpen);

        assert!(matches!(
            breaker.on_failure(true),
            Some(CircuitTransition::Opened { .. })
        ));
        assert_eq!(breaker.state(), CircuitState::Open);
        // The open timer was reset by the failure, so admission is refused
        assert_eq!(breaker.try_acquire().0, Admission::Rejected);
    }

    #[test]
    fn cancellation_does_not_count_as_failure() {
        let breaker = CircuitBreaker::new(settings(60_000));
        for _ in 0..10 {
            breaker.on_cancelled(false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }
}
