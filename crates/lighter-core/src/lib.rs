//! Core domain types for the Lighter connector.
//!
//! This crate provides the types shared by every other connector crate:
//! - `Price`, `Size`: precision-safe decimals with integer wire scaling
//! - `MarketId`, `MarketSpec`: market identity and trading rules
//! - `OrderIntent`, `ClientOrder`, `OrderState`: order lifecycle model
//! - `Fill`, `OrderUpdate`, `Position`: exchange-originated events
//! - `BookSnapshot`: full order book state from the snapshot endpoint
//! - `Network`: endpoint selection for mainnet/testnet

pub mod account;
pub mod book;
pub mod decimal;
pub mod error;
pub mod execution;
pub mod market;
pub mod order;
pub mod tx;
pub mod types;

pub use account::{Balance, FundingPayment, Position};
pub use book::{BookLevel, BookSnapshot};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use market::{MarketId, MarketSpec};
pub use order::{ClientOrderId, OrderIntent, OrderSide, OrderType, TimeInForce};
pub use tx::{TxStatus, TxType};
pub use types::{now_millis, BoxFuture, Network};

// Execution types
pub use execution::{ClientOrder, Fill, OrderState, OrderUpdate};
