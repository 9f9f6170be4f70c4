//! Per-IP WebSocket budget.
//!
//! The venue caps sessions, channel subscriptions and distinct
//! authenticated accounts per IP. One budget is shared by every
//! `ConnectionManager` in the process; requests that would cross a ceiling
//! are rejected before anything is sent.

use std::collections::{HashMap, HashSet};
use std::fmt;

use lighter_telemetry::Metrics;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{WsError, WsResult};

pub const MAX_SESSIONS: usize = 100;
pub const MAX_SUBSCRIPTIONS: usize = 1000;
pub const MAX_ACCOUNTS: usize = 10;

pub const DEFAULT_WARN_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetKind {
    Sessions,
    Subscriptions,
    Accounts,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sessions => "sessions",
            Self::Subscriptions => "subscriptions",
            Self::Accounts => "accounts",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub sessions: usize,
    pub subscriptions: usize,
    pub accounts: usize,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            sessions: MAX_SESSIONS,
            subscriptions: MAX_SUBSCRIPTIONS,
            accounts: MAX_ACCOUNTS,
        }
    }
}

impl BudgetLimits {
    fn limit(&self, kind: BudgetKind) -> usize {
        match kind {
            BudgetKind::Sessions => self.sessions,
            BudgetKind::Subscriptions => self.subscriptions,
            BudgetKind::Accounts => self.accounts,
        }
    }
}

/// Current usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetUsage {
    pub sessions: usize,
    pub subscriptions: usize,
    pub accounts: usize,
}

impl BudgetUsage {
    fn get(&self, kind: BudgetKind) -> usize {
        match kind {
            BudgetKind::Sessions => self.sessions,
            BudgetKind::Subscriptions => self.subscriptions,
            BudgetKind::Accounts => self.accounts,
        }
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    sessions: usize,
    subscriptions: usize,
    /// Subscription count per authenticated account.
    accounts: HashMap<u64, usize>,
    warned: HashSet<BudgetKind>,
}

impl BudgetState {
    fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            sessions: self.sessions,
            subscriptions: self.subscriptions,
            accounts: self.accounts.len(),
        }
    }
}

pub struct SubscriptionBudget {
    limits: BudgetLimits,
    warn_fraction: f64,
    state: Mutex<BudgetState>,
}

impl Default for SubscriptionBudget {
    fn default() -> Self {
        Self::new(BudgetLimits::default(), DEFAULT_WARN_FRACTION)
    }
}

impl SubscriptionBudget {
    pub fn new(limits: BudgetLimits, warn_fraction: f64) -> Self {
        Self {
            limits,
            warn_fraction,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn usage(&self) -> BudgetUsage {
        self.state.lock().usage()
    }

    /// Kinds whose usage is at or above the warn fraction.
    pub fn warnings(&self) -> Vec<BudgetKind> {
        let usage = self.usage();
        [
            BudgetKind::Sessions,
            BudgetKind::Subscriptions,
            BudgetKind::Accounts,
        ]
        .into_iter()
        .filter(|&kind| self.over_warn(kind, usage.get(kind)))
        .collect()
    }

    pub fn acquire_session(&self) -> WsResult<()> {
        let mut state = self.state.lock();
        self.ensure_room(BudgetKind::Sessions, state.sessions + 1)?;
        state.sessions += 1;
        self.after_change(&mut state);
        Ok(())
    }

    pub fn release_session(&self) {
        let mut state = self.state.lock();
        state.sessions = state.sessions.saturating_sub(1);
        self.after_change(&mut state);
    }

    /// Reserve one channel subscription, and an account slot when `account`
    /// is not yet subscribed to anything.
    pub fn acquire_subscription(&self, account: Option<u64>) -> WsResult<()> {
        let mut state = self.state.lock();
        self.ensure_room(BudgetKind::Subscriptions, state.subscriptions + 1)?;
        if let Some(account) = account {
            if !state.accounts.contains_key(&account) {
                self.ensure_room(BudgetKind::Accounts, state.accounts.len() + 1)?;
            }
            *state.accounts.entry(account).or_insert(0) += 1;
        }
        state.subscriptions += 1;
        self.after_change(&mut state);
        Ok(())
    }

    pub fn release_subscription(&self, account: Option<u64>) {
        let mut state = self.state.lock();
        state.subscriptions = state.subscriptions.saturating_sub(1);
        if let Some(account) = account {
            if let Some(count) = state.accounts.get_mut(&account) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.accounts.remove(&account);
                }
            }
        }
        self.after_change(&mut state);
    }

    fn ensure_room(&self, kind: BudgetKind, wanted: usize) -> WsResult<()> {
        let limit = self.limits.limit(kind);
        if wanted > limit {
            warn!(%kind, limit, "WebSocket budget exhausted, request rejected locally");
            return Err(WsError::SubscriptionLimitExceeded { kind, limit });
        }
        Ok(())
    }

    fn over_warn(&self, kind: BudgetKind, used: usize) -> bool {
        used as f64 >= self.limits.limit(kind) as f64 * self.warn_fraction
    }

    fn after_change(&self, state: &mut BudgetState) {
        let usage = state.usage();
        for kind in [
            BudgetKind::Sessions,
            BudgetKind::Subscriptions,
            BudgetKind::Accounts,
        ] {
            let used = usage.get(kind);
            Metrics::ws_budget_usage(&kind.to_string(), used);
            if self.over_warn(kind, used) {
                if state.warned.insert(kind) {
                    warn!(
                        %kind,
                        used,
                        limit = self.limits.limit(kind),
                        "WebSocket budget usage above warning threshold"
                    );
                }
            } else if state.warned.remove(&kind) {
                info!(%kind, used, "WebSocket budget usage back below warning threshold");
            }
        }
    }
}
