//! Transaction signer.
//!
//! Owns the nonce sequence for one (account, API key index) pair and the
//! auth token cache. Every signed transaction carries a freshly allocated
//! nonce; a nonce whose signature could not be produced is returned to the
//! sequence so the exchange never sees a gap for it.

use std::sync::Arc;
use std::time::Duration;

use lighter_core::{MarketSpec, OrderIntent};
use lighter_telemetry::Metrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SigningBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::{SigningError, SigningResult};
use crate::nonce::{NonceManager, NonceSource};
use crate::token::{AuthToken, AuthTokenCache};
use crate::tx::{SignedTransaction, TxParams};

/// Valid API key indices. 0 and 1 are reserved by the exchange frontends.
pub const API_KEY_INDEX_RANGE: std::ops::RangeInclusive<u8> = 2..=254;

/// Default auth token lifetime.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

pub struct Signer {
    backend: Arc<dyn SigningBackend>,
    account_index: u64,
    api_key_index: u8,
    nonces: NonceManager,
    tokens: AuthTokenCache,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("account_index", &self.account_index)
            .field("api_key_index", &self.api_key_index)
            .field("identity", &self.backend.identity())
            .finish()
    }
}

impl Signer {
    /// Create a signer for `account_index` using `api_key_index`.
    ///
    /// # Errors
    /// Returns `SigningError::InvalidApiKeyIndex` outside 2..=254.
    pub fn new(
        backend: Arc<dyn SigningBackend>,
        account_index: u64,
        api_key_index: u8,
    ) -> SigningResult<Self> {
        Self::with_clock(
            backend,
            account_index,
            api_key_index,
            DEFAULT_TOKEN_LIFETIME,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        backend: Arc<dyn SigningBackend>,
        account_index: u64,
        api_key_index: u8,
        token_lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> SigningResult<Self> {
        if !API_KEY_INDEX_RANGE.contains(&api_key_index) {
            return Err(SigningError::InvalidApiKeyIndex(api_key_index));
        }
        Ok(Self {
            backend,
            account_index,
            api_key_index,
            nonces: NonceManager::new(),
            tokens: AuthTokenCache::new(token_lifetime, clock),
        })
    }

    pub fn account_index(&self) -> u64 {
        self.account_index
    }

    pub fn api_key_index(&self) -> u8 {
        self.api_key_index
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Fetch the exchange's next nonce and adopt it.
    ///
    /// Must run at startup before any signature, and again after a
    /// rejection attributed to a nonce mismatch.
    pub async fn resync_nonce(&self, source: &dyn NonceSource) -> SigningResult<u64> {
        let exchange_next = source
            .fetch_next_nonce(self.account_index, self.api_key_index)
            .await?;
        let next = self.nonces.sync(self.api_key_index, exchange_next);
        Metrics::nonce_resync();
        info!(
            account_index = self.account_index,
            api_key_index = self.api_key_index,
            exchange_next,
            next_nonce = next,
            "Nonce resynchronized"
        );
        Ok(next)
    }

    /// Mark the sequence stale after a nonce-mismatch rejection. Signing
    /// fails with `NonceNotSynced` until `resync_nonce` completes.
    pub fn on_nonce_mismatch(&self) {
        warn!(
            api_key_index = self.api_key_index,
            "Nonce mismatch reported, sequence invalidated"
        );
        self.nonces.invalidate(self.api_key_index);
    }

    /// Allocate the next nonce for this signer's key index.
    pub fn next_nonce(&self) -> SigningResult<u64> {
        self.nonces.next(self.api_key_index)
    }

    /// Sign `params` with a newly allocated nonce.
    pub fn sign(&self, params: TxParams) -> SigningResult<SignedTransaction> {
        let nonce = self.next_nonce()?;

        let signature = params
            .digest(nonce, self.account_index, self.api_key_index)
            .and_then(|digest| self.backend.sign_digest(&digest));

        let signature = match signature {
            Ok(bytes) => format!("0x{}", hex::encode(bytes)),
            Err(e) => {
                self.nonces.release(self.api_key_index, nonce);
                return Err(e);
            }
        };

        debug!(
            tx_type = ?params.tx_type(),
            nonce,
            api_key_index = self.api_key_index,
            "Transaction signed"
        );

        Ok(SignedTransaction {
            tx_type: params.tx_type(),
            nonce,
            account_index: self.account_index,
            api_key_index: self.api_key_index,
            params,
            signature,
        })
    }

    /// Convert an order intent to wire params and sign it.
    pub fn sign_order(
        &self,
        intent: &OrderIntent,
        spec: &MarketSpec,
    ) -> SigningResult<SignedTransaction> {
        self.sign(TxParams::for_order(intent, spec)?)
    }

    /// Mint a new auth token valid for `expiry` and cache it.
    ///
    /// Token format: `{deadline_secs}:{account_index}:{api_key_index}:{sig}`.
    pub fn create_auth_token(&self, expiry: Duration) -> SigningResult<AuthToken> {
        let token = self.mint_token(self.tokens.now_ms(), expiry)?;
        self.tokens.store(token.clone());
        Ok(token)
    }

    /// Cached token, replaced once past its refresh point.
    pub fn auth_token(&self) -> SigningResult<AuthToken> {
        self.tokens
            .get_or_refresh(|now, lifetime| self.mint_token(now, lifetime))
    }

    pub fn token_cache(&self) -> &AuthTokenCache {
        &self.tokens
    }

    fn mint_token(&self, now_ms: u64, expiry: Duration) -> SigningResult<AuthToken> {
        let expires_at_ms = now_ms + expiry.as_millis() as u64;
        let message = format!(
            "{}:{}:{}",
            expires_at_ms / 1000,
            self.account_index,
            self.api_key_index
        );
        let digest = alloy::primitives::keccak256(message.as_bytes());
        let sig = self.backend.sign_digest(&digest)?;

        debug!(expires_at_ms, "Auth token created");
        Ok(AuthToken {
            token: format!("{message}:{}", hex::encode(sig)),
            issued_at_ms: now_ms,
            expires_at_ms,
        })
    }
}

/// Keep the signer's auth token fresh in the background.
///
/// Wakes at each token's refresh point and mints a replacement, so private
/// streams always find a valid token when they (re)authenticate.
pub fn spawn_token_refresher(signer: Arc<Signer>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = Duration::from_millis(signer.token_cache().until_refresh_ms());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Token refresher stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = signer.auth_token() {
                warn!(error = %e, "Auth token refresh failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    use lighter_core::{BoxFuture, MarketId};

    use super::*;
    use crate::backend::DeterministicBackend;

    struct FixedNonceSource(AtomicU64);

    impl NonceSource for FixedNonceSource {
        fn fetch_next_nonce(&self, _account: u64, _key: u8) -> BoxFuture<'_, SigningResult<u64>> {
            let value = self.0.load(Ordering::Acquire);
            Box::pin(async move { Ok(value) })
        }
    }

    fn signer_with(backend: Arc<DeterministicBackend>) -> Signer {
        Signer::new(backend, 42, 3).unwrap()
    }

    #[test]
    fn test_rejects_reserved_key_index() {
        let backend = Arc::new(DeterministicBackend::default());
        assert!(matches!(
            Signer::new(backend.clone(), 1, 1),
            Err(SigningError::InvalidApiKeyIndex(1))
        ));
        assert!(matches!(
            Signer::new(backend, 1, 255),
            Err(SigningError::InvalidApiKeyIndex(255))
        ));
    }

    #[tokio::test]
    async fn test_no_signature_before_resync() {
        let signer = signer_with(Arc::new(DeterministicBackend::default()));
        let result = signer.sign(TxParams::cancel(MarketId(0), 1));
        assert!(matches!(result, Err(SigningError::NonceNotSynced { .. })));

        signer
            .resync_nonce(&FixedNonceSource(AtomicU64::new(500)))
            .await
            .unwrap();
        let tx = signer.sign(TxParams::cancel(MarketId(0), 1)).unwrap();
        assert_eq!(tx.nonce, 500);
        assert_eq!(tx.account_index, 42);
        assert!(tx.signature.starts_with("0x"));
    }

    #[tokio::test]
    async fn test_signing_failure_returns_nonce() {
        let backend = Arc::new(DeterministicBackend::default());
        let signer = signer_with(backend.clone());
        signer
            .resync_nonce(&FixedNonceSource(AtomicU64::new(10)))
            .await
            .unwrap();

        backend.set_failing(true);
        assert!(signer.sign(TxParams::cancel(MarketId(0), 1)).is_err());

        backend.set_failing(false);
        let tx = signer.sign(TxParams::cancel(MarketId(0), 1)).unwrap();
        assert_eq!(tx.nonce, 10);
    }

    #[tokio::test]
    async fn test_mismatch_requires_resync() {
        let signer = signer_with(Arc::new(DeterministicBackend::default()));
        let source = FixedNonceSource(AtomicU64::new(1));
        signer.resync_nonce(&source).await.unwrap();
        signer.sign(TxParams::cancel(MarketId(0), 1)).unwrap();

        signer.on_nonce_mismatch();
        assert!(signer.next_nonce().is_err());

        source.0.store(20, Ordering::Release);
        signer.resync_nonce(&source).await.unwrap();
        assert_eq!(signer.next_nonce().unwrap(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_signing_unique_nonces() {
        let signer = Arc::new(signer_with(Arc::new(DeterministicBackend::default())));
        signer
            .resync_nonce(&FixedNonceSource(AtomicU64::new(1)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for task in 0..16u64 {
            let signer = Arc::clone(&signer);
            handles.push(tokio::spawn(async move {
                (0..50u64)
                    .map(|i| {
                        signer
                            .sign(TxParams::cancel(MarketId(0), task * 100 + i))
                            .unwrap()
                            .nonce
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.await.unwrap() {
                assert!(seen.insert(nonce), "nonce {nonce} issued twice");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_auth_token_cached() {
        let signer = signer_with(Arc::new(DeterministicBackend::default()));
        let a = signer.auth_token().unwrap();
        let b = signer.auth_token().unwrap();
        assert_eq!(a, b);

        let parts: Vec<&str> = a.token.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], "42");
        assert_eq!(parts[2], "3");
    }

    #[test]
    fn test_create_auth_token_replaces_cache() {
        let signer = signer_with(Arc::new(DeterministicBackend::default()));
        let token = signer.create_auth_token(Duration::from_secs(60)).unwrap();
        assert_eq!(token.expires_at_ms - token.issued_at_ms, 60_000);
        assert_eq!(signer.auth_token().unwrap(), token);
    }

    #[tokio::test]
    async fn test_token_refresher_stops_on_cancel() {
        let signer = Arc::new(signer_with(Arc::new(DeterministicBackend::default())));
        let shutdown = CancellationToken::new();
        let handle = spawn_token_refresher(Arc::clone(&signer), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signer.token_cache().fresh().is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher should stop")
            .unwrap();
    }
}
