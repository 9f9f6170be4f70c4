//! WebSocket error types.

use thiserror::Error;

use crate::budget::BudgetKind;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A per-IP ceiling would be exceeded; nothing was sent.
    #[error("Subscription limit exceeded: {kind} limit is {limit}")]
    SubscriptionLimitExceeded { kind: BudgetKind, limit: usize },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WsResult<T> = Result<T, WsError>;
