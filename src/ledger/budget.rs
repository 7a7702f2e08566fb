//! Budget tracking and enforcement
//!
//! Three scopes: a daily budget resetting at local midnight, a monthly
//! budget resetting on the first, and per-user budgets on the monthly
//! cadence. Each scope fires one warning when usage crosses the alert
//! threshold and one exceeded signal when it crosses the limit; both reset
//! with the period. Instead of timers, every touch rolls the scope forward
//! by comparing its stored period key against the current one.

use chrono::{DateTime, Datelike, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::BudgetSettings;

/// Scope a budget signal applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetScope {
    Daily,
    Monthly,
    PerUser { user: String },
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetScope::Daily => write!(f, "daily"),
            BudgetScope::Monthly => write!(f, "monthly"),
            BudgetScope::PerUser { user } => write!(f, "user:{user}"),
        }
    }
}

impl BudgetScope {
    /// Stable key used for persistence
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

/// State of one budget scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub limit: Option<f64>,
    pub used: f64,
    pub exceeded: bool,
    pub alerted: bool,
    /// Period key the state belongs to; a mismatch with the current period
    /// resets the scope
    pub period: String,
}

impl BudgetState {
    fn new(limit: Option<f64>, period: String) -> Self {
        Self {
            limit,
            used: 0.0,
            exceeded: false,
            alerted: false,
            period,
        }
    }

    fn roll(&mut self, period: &str) {
        if self.period != period {
            self.period = period.to_string();
            self.used = 0.0;
            self.exceeded = false;
            self.alerted = false;
        }
    }
}

/// What a budget crossing produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetSignalKind {
    Warning,
    Exceeded,
}

/// A threshold crossing to surface as an event and an alert row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSignal {
    pub kind: BudgetSignalKind,
    pub scope: BudgetScope,
    pub used: f64,
    pub limit: f64,
}

/// Read-only view for `budget_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatusView {
    pub scope: BudgetScope,
    pub limit: Option<f64>,
    pub used: f64,
    pub exceeded: bool,
    pub alerted: bool,
    pub period: String,
}

fn daily_period(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn monthly_period(now: DateTime<Local>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// All budget scopes for one switchboard
#[derive(Debug)]
pub struct BudgetBook {
    alert_threshold: f64,
    per_user_limit: Option<f64>,
    daily: BudgetState,
    monthly: BudgetState,
    per_user: HashMap<String, BudgetState>,
}

impl BudgetBook {
    pub fn new(settings: &BudgetSettings) -> Self {
        let now = Local::now();
        Self {
            alert_threshold: settings.alert_threshold,
            per_user_limit: settings.per_user,
            daily: BudgetState::new(settings.daily, daily_period(now)),
            monthly: BudgetState::new(settings.monthly, monthly_period(now)),
            per_user: HashMap::new(),
        }
    }

    /// Restore a persisted scope state, keeping the configured limits
    pub fn restore(&mut self, scope_key: &str, state: BudgetState) {
        match scope_key {
            "daily" => self.daily = BudgetState { limit: self.daily.limit, ..state },
            "monthly" => self.monthly = BudgetState { limit: self.monthly.limit, ..state },
            _ => {
                if let Some(user) = scope_key.strip_prefix("user:") {
                    self.per_user.insert(
                        user.to_string(),
                        BudgetState { limit: self.per_user_limit, ..state },
                    );
                }
            }
        }
    }

    fn check(state: &mut BudgetState, scope: BudgetScope, threshold: f64) -> Vec<BudgetSignal> {
        let Some(limit) = state.limit else {
            return Vec::new();
        };
        let mut signals = Vec::new();
        if !state.alerted && state.used > limit * threshold {
            state.alerted = true;
            signals.push(BudgetSignal {
                kind: BudgetSignalKind::Warning,
                scope: scope.clone(),
                used: state.used,
                limit,
            });
        }
        if !state.exceeded && state.used > limit {
            state.exceeded = true;
            signals.push(BudgetSignal {
                kind: BudgetSignalKind::Exceeded,
                scope,
                used: state.used,
                limit,
            });
        }
        signals
    }

    /// Add a cost to every applicable scope and report threshold crossings
    pub fn apply(&mut self, cost: f64, user: Option<&str>, now: DateTime<Local>) -> Vec<BudgetSignal> {
        let threshold = self.alert_threshold;
        let mut signals = Vec::new();

        self.daily.roll(&daily_period(now));
        self.daily.used += cost;
        signals.extend(Self::check(&mut self.daily, BudgetScope::Daily, threshold));

        self.monthly.roll(&monthly_period(now));
        self.monthly.used += cost;
        signals.extend(Self::check(&mut self.monthly, BudgetScope::Monthly, threshold));

        if let Some(user) = user {
            let state = self
                .per_user
                .entry(user.to_string())
                .or_insert_with(|| BudgetState::new(self.per_user_limit, monthly_period(now)));
            state.roll(&monthly_period(now));
            state.used += cost;
            signals.extend(Self::check(
                state,
                BudgetScope::PerUser { user: user.to_string() },
                threshold,
            ));
        }

        signals
    }

    /// First exceeded scope that applies to this request, if any
    pub fn exceeded_scope(&mut self, user: Option<&str>, now: DateTime<Local>) -> Option<BudgetSignal> {
        self.daily.roll(&daily_period(now));
        self.monthly.roll(&monthly_period(now));

        let exceeded = |state: &BudgetState, scope: BudgetScope| {
            state.exceeded.then(|| BudgetSignal {
                kind: BudgetSignalKind::Exceeded,
                scope,
                used: state.used,
                limit: state.limit.unwrap_or(0.0),
            })
        };

        if let Some(signal) = exceeded(&self.daily, BudgetScope::Daily) {
            return Some(signal);
        }
        if let Some(signal) = exceeded(&self.monthly, BudgetScope::Monthly) {
            return Some(signal);
        }
        if let Some(user) = user {
            if let Some(state) = self.per_user.get_mut(user) {
                state.roll(&monthly_period(now));
                return exceeded(state, BudgetScope::PerUser { user: user.to_string() });
            }
        }
        None
    }

    /// Snapshot of a scope's state for persistence
    pub fn state_of(&self, scope: &BudgetScope) -> Option<BudgetState> {
        match scope {
            BudgetScope::Daily => Some(self.daily.clone()),
            BudgetScope::Monthly => Some(self.monthly.clone()),
            BudgetScope::PerUser { user } => self.per_user.get(user).cloned(),
        }
    }

    pub fn status(&self) -> Vec<BudgetStatusView> {
        let view = |scope: BudgetScope, state: &BudgetState| BudgetStatusView {
            scope,
            limit: state.limit,
            used: state.used,
            exceeded: state.exceeded,
            alerted: state.alerted,
            period: state.period.clone(),
        };
        let mut status = vec![
            view(BudgetScope::Daily, &self.daily),
            view(BudgetScope::Monthly, &self.monthly),
        ];
        for (user, state) in &self.per_user {
            status.push(view(BudgetScope::PerUser { user: user.clone() }, state));
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(daily: Option<f64>) -> BudgetSettings {
        BudgetSettings {
            daily,
            monthly: None,
            per_user: None,
            alert_threshold: 0.8,
        }
    }

    #[test]
    fn warning_then_exceeded_fire_once_each() {
        let mut book = BudgetBook::new(&settings(Some(1.0)));
        let now = Local::now();

        let signals = book.apply(0.85, None, now);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, BudgetSignalKind::Warning);
        assert_eq!(signals[0].scope, BudgetScope::Daily);

        let signals = book.apply(0.20, None, now);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, BudgetSignalKind::Exceeded);
        assert!((signals[0].used - 1.05).abs() < 1e-9);

        // Already alerted and exceeded: silence
        assert!(book.apply(0.50, None, now).is_empty());
        assert!(book.exceeded_scope(None, now).is_some());
    }

    #[test]
    fn unlimited_budget_never_signals() {
        let mut book = BudgetBook::new(&settings(None));
        let now = Local::now();
        assert!(book.apply(1_000_000.0, None, now).is_empty());
        assert!(book.exceeded_scope(None, now).is_none());
    }

    #[test]
    fn daily_reset_clears_flags() {
        let mut book = BudgetBook::new(&settings(Some(1.0)));
        let now = Local::now();
        book.apply(2.0, None, now);
        assert!(book.exceeded_scope(None, now).is_some());

        let tomorrow = now + chrono::Duration::days(1);
        assert!(book.exceeded_scope(None, tomorrow).is_none());
        let status = book.status();
        let daily = status
            .iter()
            .find(|s| s.scope == BudgetScope::Daily)
            .unwrap();
        assert_eq!(daily.used, 0.0);
        assert!(!daily.alerted);
    }

    #[test]
    fn per_user_budget_is_isolated() {
        let mut book = BudgetBook::new(&BudgetSettings {
            daily: None,
            monthly: None,
            per_user: Some(1.0),
            alert_threshold: 0.8,
        });
        let now = Local::now();

        let signals = book.apply(1.5, Some("alice"), now);
        assert!(signals
            .iter()
            .any(|s| s.kind == BudgetSignalKind::Exceeded
                && s.scope == BudgetScope::PerUser { user: "alice".into() }));

        assert!(book.exceeded_scope(Some("alice"), now).is_some());
        assert!(book.exceeded_scope(Some("bob"), now).is_none());
        assert!(book.exceeded_scope(None, now).is_none());
    }

    #[test]
    fn one_large_record_fires_warning_and_exceeded_together() {
        let mut book = BudgetBook::new(&settings(Some(1.0)));
        let signals = book.apply(1.2, None, Local::now());
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].kind, BudgetSignalKind::Warning);
        assert_eq!(signals[1].kind, BudgetSignalKind::Exceeded);
    }

    #[test]
    fn restore_keeps_configured_limits() {
        let mut book = BudgetBook::new(&settings(Some(5.0)));
        book.restore(
            "daily",
            BudgetState {
                limit: Some(99.0), // stale persisted limit loses to config
                used: 3.0,
                exceeded: false,
                alerted: false,
                period: daily_period(Local::now()),
            },
        );
        let status = book.status();
        let daily = status
            .iter()
            .find(|s| s.scope == BudgetScope::Daily)
            .unwrap();
        assert_eq!(daily.limit, Some(5.0));
        assert_eq!(daily.used, 3.0);
    }
}
