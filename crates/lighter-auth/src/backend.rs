//! Signing backends.
//!
//! The `Signer` never touches key material directly; it hands a 32-byte
//! digest to a `SigningBackend`. This keeps nonce sequencing and token
//! caching testable with `DeterministicBackend`, independent of the real
//! cryptography.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{keccak256, B256};
use alloy::signers::SignerSync;

use crate::error::{SigningError, SigningResult};
use crate::keys::KeyManager;

/// Capability to sign a digest with the API key.
pub trait SigningBackend: Send + Sync {
    /// Sign a 32-byte digest, returning raw signature bytes.
    fn sign_digest(&self, digest: &B256) -> SigningResult<Vec<u8>>;

    /// Public identity of the key, safe to log.
    fn identity(&self) -> String;
}

/// Backend signing with a locally loaded private key.
#[derive(Debug)]
pub struct LocalKeyBackend {
    keys: Arc<KeyManager>,
}

impl LocalKeyBackend {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }
}

impl SigningBackend for LocalKeyBackend {
    fn sign_digest(&self, digest: &B256) -> SigningResult<Vec<u8>> {
        // NOTE: Do not log signature material
        let signature = self.keys.signer().sign_hash_sync(digest)?;
        Ok(signature.as_bytes().to_vec())
    }

    fn identity(&self) -> String {
        self.keys.address().to_string()
    }
}

/// Reproducible backend for tests: the "signature" is
/// `keccak256(seed || digest)`.
#[derive(Debug)]
pub struct DeterministicBackend {
    seed: Vec<u8>,
    failing: AtomicBool,
}

impl DeterministicBackend {
    pub fn new(seed: impl Into<Vec<u8>>) -> Self {
        Self {
            seed: seed.into(),
            failing: AtomicBool::new(false),
        }
    }

    /// Make subsequent signing calls fail with `SigningError::Backend`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl Default for DeterministicBackend {
    fn default() -> Self {
        Self::new(b"deterministic".to_vec())
    }
}

impl SigningBackend for DeterministicBackend {
    fn sign_digest(&self, digest: &B256) -> SigningResult<Vec<u8>> {
        if self.failing.load(Ordering::Acquire) {
            return Err(SigningError::Backend("backend unavailable".to_string()));
        }
        let mut data = self.seed.clone();
        data.extend_from_slice(digest.as_slice());
        Ok(keccak256(&data).to_vec())
    }

    fn identity(&self) -> String {
        format!("deterministic:{}", hex::encode(&self.seed))
    }
}
