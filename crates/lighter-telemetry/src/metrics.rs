//! Prometheus metrics for the Lighter connector.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which must crash at startup. These panics only
//! happen during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge_vec,
    CounterVec, Encoder, GaugeVec, IntCounter, IntGaugeVec, TextEncoder,
};

use crate::error::TelemetryResult;

/// WebSocket connection state per stream (1 = connected).
pub static WS_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "lighter_ws_connected",
        "WebSocket connection state (1=connected)",
        &["stream"]
    )
    .unwrap()
});

/// Current connection state machine state.
/// Labels: stream, state (disconnected/connecting/connected/authenticating)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "lighter_ws_state",
        "WebSocket state machine current state (1=active, 0=inactive)",
        &["stream", "state"]
    )
    .unwrap()
});

pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lighter_ws_reconnect_total",
        "Total WebSocket reconnection attempts",
        &["stream"]
    )
    .unwrap()
});

/// Active channel subscriptions per kind (sessions/subscriptions/accounts).
pub static WS_BUDGET_USAGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "lighter_ws_budget_usage",
        "Per-IP WebSocket budget usage",
        &["kind"]
    )
    .unwrap()
});

/// Labels: class, source (local/remote)
pub static RATE_LIMIT_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lighter_rate_limit_rejected_total",
        "Requests rejected by the rate budget",
        &["class", "source"]
    )
    .unwrap()
});

/// Orders reaching a terminal state. Labels: state
pub static ORDERS_TERMINAL_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lighter_orders_terminal_total",
        "Orders reaching a terminal state",
        &["state"]
    )
    .unwrap()
});

pub static ORDERS_RECONCILED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lighter_orders_reconciled_total",
        "Order status reconciliations by trigger",
        &["trigger"]
    )
    .unwrap()
});

pub static BOOK_RESYNC_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lighter_book_resync_total",
        "Order book resynchronizations",
        &["market"]
    )
    .unwrap()
});

pub static NONCE_RESYNC_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lighter_nonce_resync_total",
        "Nonce resynchronizations from the exchange"
    )
    .unwrap()
});

const WS_STATES: [&str; 4] = ["disconnected", "connecting", "connected", "authenticating"];

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    pub fn ws_connected(stream: &str) {
        WS_CONNECTED.with_label_values(&[stream]).set(1.0);
    }

    pub fn ws_disconnected(stream: &str) {
        WS_CONNECTED.with_label_values(&[stream]).set(0.0);
    }

    /// Set the active state to 1 and every other state to 0.
    pub fn ws_state_set(stream: &str, state: &str) {
        for s in WS_STATES {
            WS_STATE.with_label_values(&[stream, s]).set(0.0);
        }
        WS_STATE.with_label_values(&[stream, state]).set(1.0);
    }

    pub fn ws_reconnect(stream: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[stream]).inc();
    }

    pub fn ws_budget_usage(kind: &str, used: usize) {
        WS_BUDGET_USAGE
            .with_label_values(&[kind])
            .set(i64::try_from(used).unwrap_or(i64::MAX));
    }

    pub fn rate_limited(class: &str, remote: bool) {
        let source = if remote { "remote" } else { "local" };
        RATE_LIMIT_REJECTED_TOTAL
            .with_label_values(&[class, source])
            .inc();
    }

    pub fn order_terminal(state: &str) {
        ORDERS_TERMINAL_TOTAL.with_label_values(&[state]).inc();
    }

    pub fn order_reconciled(trigger: &str) {
        ORDERS_RECONCILED_TOTAL.with_label_values(&[trigger]).inc();
    }

    pub fn book_resync(market: &str) {
        BOOK_RESYNC_TOTAL.with_label_values(&[market]).inc();
    }

    pub fn nonce_resync() {
        NONCE_RESYNC_TOTAL.inc();
    }

    /// Render the default registry in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
