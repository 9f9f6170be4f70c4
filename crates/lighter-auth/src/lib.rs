//! Signing and authentication for the Lighter connector.
//!
//! Lighter authenticates writes with per-transaction signatures rather than
//! bearer tokens. This crate owns everything needed to produce them:
//! - `NonceManager`: one strictly increasing sequence per API key index
//! - `SigningBackend`: narrow capability over the key material
//! - `Signer`: nonce allocation + digest + signature into a `SignedTransaction`
//! - `AuthTokenCache`: short-lived WebSocket tokens, refreshed ahead of expiry

pub mod backend;
pub mod clock;
pub mod error;
pub mod keys;
pub mod nonce;
pub mod signer;
pub mod token;
pub mod tx;

pub use backend::{DeterministicBackend, LocalKeyBackend, SigningBackend};
pub use clock::{Clock, SystemClock};
pub use error::{KeyError, SigningError, SigningResult};
pub use keys::{KeyManager, KeySource};
pub use nonce::{NonceManager, NonceSource};
pub use signer::{spawn_token_refresher, Signer};
pub use token::{AuthToken, AuthTokenCache};
pub use tx::{CancelAllParams, CancelOrderParams, CreateOrderParams, SignedTransaction, TxParams};
