//! API key material loading.
//!
//! Security notes:
//! - Key bytes are held in `Zeroizing` buffers until handed to the signer.
//! - Keys are loaded once at startup; no runtime key rotation.
//! - Never log key material.

use std::path::PathBuf;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::KeyError;

/// Source of the API private key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum KeySource {
    /// Load from environment variable (development).
    EnvVar { var_name: String },
    /// Load from file (production, recommend 0600 permissions).
    File { path: PathBuf },
}

/// Holds the loaded API key.
pub struct KeyManager {
    signer: PrivateKeySigner,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("address", &self.signer.address())
            .finish()
    }
}

// Parse hex key from string (supports 0x prefix and whitespace trimming)
fn parse_hex_key(hex_str: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    Ok(Zeroizing::new(hex::decode(trimmed)?))
}

impl KeyManager {
    /// Load the key from the given source.
    ///
    /// # Errors
    /// Returns `KeyError` if the variable/file is missing, the content is not
    /// hex, or the bytes are not a valid private key.
    pub fn load(source: &KeySource) -> Result<Self, KeyError> {
        let secret_bytes = match source {
            KeySource::EnvVar { var_name } => {
                let hex = Zeroizing::new(
                    std::env::var(var_name)
                        .map_err(|_| KeyError::EnvVarNotFound(var_name.clone()))?,
                );
                parse_hex_key(&hex)?
            }
            KeySource::File { path } => {
                let content = Zeroizing::new(std::fs::read_to_string(path)?);
                parse_hex_key(&content)?
            }
        };
        Self::from_bytes(&secret_bytes)
    }

    pub fn from_bytes(secret_bytes: &[u8]) -> Result<Self, KeyError> {
        let signer = PrivateKeySigner::from_slice(secret_bytes)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(Self { signer })
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// Public identity of the key, safe to log.
    pub fn address(&self) -> Address {
        self.signer.address()
    }
}
