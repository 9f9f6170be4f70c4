//! Connector error types.

use lighter_core::{ClientOrderId, MarketId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(#[from] lighter_auth::KeyError),

    #[error("Signing error: {0}")]
    Signing(#[from] lighter_auth::SigningError),

    #[error("REST error: {0}")]
    Rest(#[from] lighter_rest::RestError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] lighter_ws::WsError),

    #[error("Feed error: {0}")]
    Feed(#[from] lighter_feed::FeedError),

    #[error("User stream error: {0}")]
    Account(#[from] lighter_account::AccountError),

    #[error("Order tracker error: {0}")]
    Tracker(#[from] lighter_orders::TrackerError),

    #[error("Unknown market: {0}")]
    UnknownMarket(MarketId),

    /// Market orders are priced off the book mid; the book is not synced.
    #[error("No mid price for market {0}")]
    NoMidPrice(MarketId),

    /// The exchange order index is not known yet, so the order cannot be
    /// addressed by a cancel transaction.
    #[error("Order {0} not acknowledged yet")]
    NotAcknowledged(ClientOrderId),

    #[error("Order {client_order_id} rejected: {reason}")]
    Rejected {
        client_order_id: ClientOrderId,
        reason: String,
    },

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] lighter_telemetry::TelemetryError),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
