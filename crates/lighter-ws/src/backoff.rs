//! Reconnect backoff.

use std::time::Duration;

pub const DEFAULT_FLOOR: Duration = Duration::from_secs(1);
pub const DEFAULT_CEILING: Duration = Duration::from_secs(60);
pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_secs(30);

/// Exponential backoff (×2) between a floor and a ceiling.
///
/// The delay persists across attempts within one outage episode. It only
/// returns to the floor once a connection has stayed up for at least the
/// stability threshold, so a link that flaps right after connecting keeps
/// backing off.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    stability_threshold: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING, DEFAULT_STABILITY_THRESHOLD)
    }
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, stability_threshold: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            stability_threshold,
            current: floor,
        }
    }

    /// Delay before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Delay the next call to `next_delay` will return.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// A connection ended after being up for `uptime`.
    ///
    /// Returns true if the backoff was reset.
    pub fn on_session_end(&mut self, uptime: Duration) -> bool {
        if uptime >= self.stability_threshold {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
