//! WebSocket connection manager for Lighter streams.
//!
//! - Reconnection with exponential backoff (1s floor, 60s ceiling) that
//!   only resets after a connection proved stable
//! - Fresh auth token before every private (re)connect
//! - Per-IP session/subscription/account budget checked before any send
//! - Application-level ping/pong heartbeat
//! - Subscriptions restored after every reconnect

pub mod backoff;
pub mod budget;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;

pub use backoff::Backoff;
pub use budget::{BudgetKind, BudgetLimits, BudgetUsage, SubscriptionBudget};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, StreamEvent, TokenProvider,
};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;
pub use message::{Channel, ChannelMessage, ControlMessage, Subscription, WsMessage, WsRequest};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Install the TLS crypto provider.
/// Must be called before any WebSocket connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
