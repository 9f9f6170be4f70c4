//! WebSocket auth tokens.
//!
//! Private channels require a short-lived token derived from the API key.
//! Tokens are cached and replaced once a fixed fraction of their lifetime
//! has elapsed, so a reconnecting stream never presents one that is about
//! to expire.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::SigningResult;

/// Default share of the lifetime after which a token is replaced.
pub const DEFAULT_REFRESH_FRACTION: f64 = 0.8;

/// A signed auth token with its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    /// Unix milliseconds.
    pub issued_at_ms: u64,
    /// Unix milliseconds.
    pub expires_at_ms: u64,
}

impl AuthToken {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Instant after which the token should be replaced.
    pub fn refresh_due_ms(&self, fraction: f64) -> u64 {
        let lifetime = self.expires_at_ms.saturating_sub(self.issued_at_ms);
        self.issued_at_ms + (lifetime as f64 * fraction) as u64
    }
}

/// Cache of the current token.
pub struct AuthTokenCache {
    lifetime: Duration,
    refresh_fraction: f64,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<AuthToken>>,
}

impl AuthTokenCache {
    pub fn new(lifetime: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            lifetime,
            refresh_fraction: DEFAULT_REFRESH_FRACTION,
            clock,
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_refresh_fraction(mut self, fraction: f64) -> Self {
        self.refresh_fraction = fraction.clamp(0.05, 1.0);
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Cached token if it has not yet reached its refresh point.
    pub fn fresh(&self) -> Option<AuthToken> {
        let now = self.clock.now_ms();
        self.current
            .lock()
            .as_ref()
            .filter(|t| now < t.refresh_due_ms(self.refresh_fraction))
            .cloned()
    }

    /// Return the cached token or mint a new one with `create`.
    pub fn get_or_refresh<F>(&self, create: F) -> SigningResult<AuthToken>
    where
        F: FnOnce(u64, Duration) -> SigningResult<AuthToken>,
    {
        let mut guard = self.current.lock();
        let now = self.clock.now_ms();
        if let Some(token) = guard.as_ref() {
            if now < token.refresh_due_ms(self.refresh_fraction) {
                return Ok(token.clone());
            }
        }
        let token = create(now, self.lifetime)?;
        *guard = Some(token.clone());
        Ok(token)
    }

    pub fn store(&self, token: AuthToken) {
        *self.current.lock() = Some(token);
    }

    /// Milliseconds until the cached token should be refreshed (0 if due or
    /// absent).
    pub fn until_refresh_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        self.current
            .lock()
            .as_ref()
            .map(|t| t.refresh_due_ms(self.refresh_fraction).saturating_sub(now))
            .unwrap_or(0)
    }
}
