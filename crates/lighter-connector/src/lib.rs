//! Lighter exchange connector.
//!
//! Composes the signer, REST dispatcher, public and private WebSocket
//! streams and the order tracker behind [`SpotConnector`] and
//! [`PerpetualConnector`].

pub mod config;
pub mod error;
pub mod perpetual;
pub mod spot;

pub use config::{ConnectorConfig, WsSettings};
pub use error::{ConnectorError, ConnectorResult};
pub use perpetual::PerpetualConnector;
pub use spot::{slippage_bound, SpotConnector, MARKET_ORDER_SLIPPAGE_BPS};

pub use lighter_orders::OrderEvent;
pub use lighter_telemetry::init_logging;
