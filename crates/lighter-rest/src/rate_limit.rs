//! Weighted fixed-window rate budget.
//!
//! Each weight class has its own budget per window, sized by the account
//! tier. Budget is taken optimistically when a request is admitted and
//! handed back if the request never reaches the network (the permit is
//! dropped without being committed).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lighter_telemetry::Metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RestError, RestResult};

/// Length of one budget window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Requests per window per class on the standard tier.
const STANDARD_REQUESTS_PER_WINDOW: u32 = 60;

/// Weight units per window per class on the premium tier.
const PREMIUM_WEIGHT_PER_WINDOW: u32 = 24_000;

/// Endpoint category with its per-request cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightClass {
    /// sendTx, sendTxBatch, nextNonce.
    Transaction,
    Info,
    PublicData,
    AccountData,
    Default,
}

impl WeightClass {
    pub const ALL: [WeightClass; 5] = [
        Self::Transaction,
        Self::Info,
        Self::PublicData,
        Self::AccountData,
        Self::Default,
    ];

    pub fn weight(&self) -> u32 {
        match self {
            Self::Transaction => 6,
            Self::Info => 100,
            Self::PublicData => 50,
            Self::AccountData => 100,
            Self::Default => 300,
        }
    }
}

impl fmt::Display for WeightClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transaction => "transaction",
            Self::Info => "info",
            Self::PublicData => "public_data",
            Self::AccountData => "account_data",
            Self::Default => "default",
        };
        write!(f, "{s}")
    }
}

/// Account tier; determines the per-class budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    #[default]
    Standard,
    Premium,
}

impl AccountTier {
    /// Weight units available to `class` per window.
    pub fn class_budget(&self, class: WeightClass) -> u32 {
        match self {
            Self::Standard => STANDARD_REQUESTS_PER_WINDOW * class.weight(),
            Self::Premium => PREMIUM_WEIGHT_PER_WINDOW,
        }
    }
}

#[derive(Debug)]
struct ClassState {
    capacity: u32,
    consumed: u32,
    window_id: u64,
    resets_at: Instant,
    warned: bool,
}

#[derive(Debug)]
struct BudgetState {
    window: Duration,
    warn_fraction: f64,
    classes: HashMap<WeightClass, ClassState>,
}

impl BudgetState {
    fn roll(&mut self, class: WeightClass, now: Instant) -> &mut ClassState {
        let window = self.window;
        // Every class is seeded in `RateBudget::new`
        let state = self
            .classes
            .entry(class)
            .or_insert_with(|| ClassState {
                capacity: 0,
                consumed: 0,
                window_id: 0,
                resets_at: now + window,
                warned: false,
            });
        if now >= state.resets_at {
            state.consumed = 0;
            state.window_id += 1;
            state.resets_at = now + window;
            state.warned = false;
        }
        state
    }
}

/// Read-only view of one class budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub class: WeightClass,
    pub weight: u32,
    pub capacity: u32,
    pub consumed: u32,
    pub resets_at: Instant,
}

impl BudgetSnapshot {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.consumed)
    }
}

/// Process-wide rate budget. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct RateBudget {
    tier: AccountTier,
    state: Arc<Mutex<BudgetState>>,
}

impl RateBudget {
    pub fn new(tier: AccountTier) -> Self {
        Self::with_window(tier, WINDOW)
    }

    pub fn with_window(tier: AccountTier, window: Duration) -> Self {
        let now = Instant::now();
        let classes = WeightClass::ALL
            .iter()
            .map(|&class| {
                (
                    class,
                    ClassState {
                        capacity: tier.class_budget(class),
                        consumed: 0,
                        window_id: 0,
                        resets_at: now + window,
                        warned: false,
                    },
                )
            })
            .collect();

        Self {
            tier,
            state: Arc::new(Mutex::new(BudgetState {
                window,
                warn_fraction: 0.8,
                classes,
            })),
        }
    }

    #[must_use]
    pub fn with_warn_fraction(self, fraction: f64) -> Self {
        self.state.lock().warn_fraction = fraction;
        self
    }

    pub fn tier(&self) -> AccountTier {
        self.tier
    }

    /// Take one request's weight from `class`, or fail with
    /// `RateLimitExceeded` without touching the budget.
    pub fn try_acquire(&self, class: WeightClass) -> RestResult<BudgetPermit> {
        let weight = class.weight();
        let now = Instant::now();
        let mut guard = self.state.lock();
        let warn_fraction = guard.warn_fraction;
        let state = guard.roll(class, now);

        if state.consumed + weight > state.capacity {
            let reset_at = state.resets_at;
            debug!(%class, consumed = state.consumed, capacity = state.capacity, "Budget exhausted");
            Metrics::rate_limited(&class.to_string(), false);
            return Err(RestError::RateLimitExceeded {
                class,
                reset_at,
                retry_after: reset_at.saturating_duration_since(now),
            });
        }

        state.consumed += weight;
        if !state.warned && f64::from(state.consumed) >= f64::from(state.capacity) * warn_fraction {
            state.warned = true;
            warn!(
                %class,
                consumed = state.consumed,
                capacity = state.capacity,
                "Approaching rate limit"
            );
        }

        Ok(BudgetPermit {
            budget: self.clone(),
            class,
            weight,
            window_id: state.window_id,
            armed: true,
        })
    }

    fn refund(&self, class: WeightClass, weight: u32, window_id: u64) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.classes.get_mut(&class) {
            // Consumption from an earlier window is already gone
            if state.window_id == window_id {
                state.consumed = state.consumed.saturating_sub(weight);
            }
        }
    }

    /// The exchange answered 429: treat the class as exhausted until the
    /// later of the current window end and `retry_after`.
    pub fn on_rate_limited(&self, class: WeightClass, retry_after: Option<Duration>) -> Instant {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = guard.roll(class, now);

        state.consumed = state.capacity;
        Metrics::rate_limited(&class.to_string(), true);
        if let Some(retry_after) = retry_after {
            state.resets_at = state.resets_at.max(now + retry_after);
        }
        warn!(
            %class,
            retry_after_ms = state.resets_at.saturating_duration_since(now).as_millis() as u64,
            "Remote rate limit hit, local budget zeroed"
        );
        state.resets_at
    }

    pub fn snapshot(&self, class: WeightClass) -> BudgetSnapshot {
        let mut guard = self.state.lock();
        let state = guard.roll(class, Instant::now());
        BudgetSnapshot {
            class,
            weight: class.weight(),
            capacity: state.capacity,
            consumed: state.consumed,
            resets_at: state.resets_at,
        }
    }
}

/// Reserved budget for one request.
///
/// Dropping an uncommitted permit returns its weight to the budget.
#[derive(Debug)]
#[must_use = "dropping a permit refunds its budget"]
pub struct BudgetPermit {
    budget: RateBudget,
    class: WeightClass,
    weight: u32,
    window_id: u64,
    armed: bool,
}

impl BudgetPermit {
    pub fn class(&self) -> WeightClass {
        self.class
    }

    /// The request reached the network; the weight stays consumed.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        if self.armed {
            self.budget.refund(self.class, self.weight, self.window_id);
        }
    }
}
