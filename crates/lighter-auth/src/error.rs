//! Error types for lighter-auth.

use thiserror::Error;

/// Signing errors.
///
/// Fatal to the intent being signed, never to the process.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("No signing key available")]
    MissingKey,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("API key index {0} outside 2..=254")]
    InvalidApiKeyIndex(u8),

    #[error("Nonce for API key {api_key_index} not synchronized with the exchange")]
    NonceNotSynced { api_key_index: u8 },

    #[error("Nonce sequence exhausted for API key {api_key_index}")]
    NonceExhausted { api_key_index: u8 },

    #[error("Nonce synchronization failed: {0}")]
    NonceSync(String),

    #[error("Transaction serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid order parameters: {0}")]
    InvalidParams(#[from] lighter_core::CoreError),

    #[error("Signing backend failed: {0}")]
    Backend(String),
}

impl From<alloy::signers::Error> for SigningError {
    fn from(e: alloy::signers::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Key management errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Failed to decode hex: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for signing operations.
pub type SigningResult<T> = Result<T, SigningError>;
