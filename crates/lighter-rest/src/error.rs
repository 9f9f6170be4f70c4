//! REST error types.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::endpoints::{ORDER_NOT_EXIST_MESSAGE, UNKNOWN_ORDER_MESSAGE};
use crate::rate_limit::WeightClass;

#[derive(Debug, Error)]
pub enum RestError {
    /// Local budget exhausted; retry at `reset_at`.
    #[error("Rate limit exceeded for {class} class, retry in {retry_after:?}")]
    RateLimitExceeded {
        class: WeightClass,
        reset_at: Instant,
        retry_after: Duration,
    },

    #[error("Remote error {status}: {body}")]
    Remote { status: u16, body: String },

    /// The request reached the network but no answer arrived in time.
    #[error("Request timed out")]
    Timeout,

    /// Failed before any byte reached the network; nothing was sent.
    #[error("Request not sent: {0}")]
    NotSent(String),

    /// The connection broke after the request was sent.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signing error: {0}")]
    Signing(#[from] lighter_auth::SigningError),
}

impl RestError {
    /// 5xx, transport failures and rate limits may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { status, .. } => *status >= 500,
            Self::RateLimitExceeded { .. } | Self::NotSent(_) | Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Outcome unknown: the exchange may have applied the request.
    ///
    /// Covers timeouts, connections lost mid-request, 5xx answers and 2xx
    /// answers whose body could not be read.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::Decode(_) => true,
            Self::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The request provably never left the process.
    pub fn is_not_sent(&self) -> bool {
        matches!(self, Self::NotSent(_))
    }

    pub fn is_nonce_mismatch(&self) -> bool {
        match self {
            Self::Remote { body, .. } => body.to_ascii_lowercase().contains("nonce"),
            _ => false,
        }
    }

    pub fn is_order_not_found(&self) -> bool {
        match self {
            Self::Remote { status, body } => {
                *status == 404
                    || body.contains(ORDER_NOT_EXIST_MESSAGE)
                    || body.contains(UNKNOWN_ORDER_MESSAGE)
            }
            _ => false,
        }
    }
}

pub type RestResult<T> = Result<T, RestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let server = RestError::Remote {
            status: 503,
            body: String::new(),
        };
        let client = RestError::Remote {
            status: 400,
            body: "invalid nonce".to_string(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(client.is_nonce_mismatch());
        assert!(RestError::Timeout.is_ambiguous());
        assert!(!RestError::Timeout.is_retryable());
    }

    #[test]
    fn test_ambiguity() {
        let bad_gateway = RestError::Remote {
            status: 502,
            body: "bad gateway".to_string(),
        };
        let rejected = RestError::Remote {
            status: 400,
            body: "invalid price".to_string(),
        };
        assert!(bad_gateway.is_ambiguous());
        assert!(!rejected.is_ambiguous());
        assert!(RestError::Decode("sendTx: eof".into()).is_ambiguous());
        assert!(RestError::Transport("reset by peer".into()).is_ambiguous());

        let unsent = RestError::NotSent("connection refused".into());
        assert!(!unsent.is_ambiguous());
        assert!(unsent.is_not_sent());
        assert!(unsent.is_retryable());
    }

    #[test]
    fn test_order_not_found() {
        let err = RestError::Remote {
            status: 400,
            body: "{\"code\":21500,\"message\":\"order not found\"}".to_string(),
        };
        assert!(err.is_order_not_found());
    }
}
