//! Heartbeat management for WebSocket connections.
//!
//! Tracks ping/pong timing and message activity on tokio's clock.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct HeartbeatState {
    last_ping: Option<Instant>,
    last_message: Instant,
    waiting_for_pong: bool,
}

pub struct HeartbeatManager {
    /// Idle time after which a ping is sent.
    interval: Duration,
    /// How long to wait for the pong.
    timeout: Duration,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatManager {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            state: Mutex::new(HeartbeatState {
                last_ping: None,
                last_message: Instant::now(),
                waiting_for_pong: false,
            }),
        }
    }

    /// Called on every new connection.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_ping = None;
        state.last_message = Instant::now();
        state.waiting_for_pong = false;
    }

    pub fn record_ping(&self) {
        let mut state = self.state.lock();
        state.last_ping = Some(Instant::now());
        state.waiting_for_pong = true;
    }

    pub fn record_pong(&self) {
        let mut state = self.state.lock();
        state.waiting_for_pong = false;
        if let Some(ping) = state.last_ping {
            debug!(rtt_ms = ping.elapsed().as_millis() as u64, "Received pong");
        }
    }

    /// Any inbound frame counts as liveness.
    pub fn record_message(&self) {
        self.state.lock().last_message = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        let state = self.state.lock();
        match (state.waiting_for_pong, state.last_ping) {
            (true, Some(ping)) => ping.elapsed() > self.timeout,
            _ => false,
        }
    }

    /// True when idle for a full interval and no ping is outstanding.
    pub fn should_send_ping(&self) -> bool {
        let state = self.state.lock();
        !state.waiting_for_pong && state.last_message.elapsed() >= self.interval
    }

    /// How often the connection loop should evaluate the heartbeat.
    pub fn check_interval(&self) -> Duration {
        (self.interval / 2).min(self.timeout).max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_after_idle_interval() {
        let hb = HeartbeatManager::new(Duration::from_secs(30), Duration::from_secs(10));
        assert!(!hb.should_send_ping());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(hb.should_send_ping());

        hb.record_ping();
        assert!(!hb.should_send_ping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_timeout() {
        let hb = HeartbeatManager::new(Duration::from_secs(30), Duration::from_secs(10));
        hb.record_ping();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!hb.is_timed_out());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(hb.is_timed_out());

        hb.record_pong();
        assert!(!hb.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_defers_ping() {
        let hb = HeartbeatManager::new(Duration::from_secs(30), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(20)).await;
        hb.record_message();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!hb.should_send_ping());
    }
}
