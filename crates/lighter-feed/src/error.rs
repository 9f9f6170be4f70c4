//! Feed error types.

use std::time::Duration;

use lighter_core::MarketId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// A diff does not chain onto the book. Handled by a full resync.
    #[error("Book desync on market {market}: expected update {expected}, got {got}")]
    Desync {
        market: MarketId,
        expected: u64,
        got: u64,
    },

    #[error("Snapshot unavailable: {reason}")]
    SnapshotUnavailable {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Book stream closed")]
    StreamClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Desync { .. })
    }
}

impl From<lighter_rest::RestError> for FeedError {
    fn from(e: lighter_rest::RestError) -> Self {
        let retry_after = match &e {
            lighter_rest::RestError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        };
        Self::SnapshotUnavailable {
            reason: e.to_string(),
            retry_after,
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
