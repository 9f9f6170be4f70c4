//! Account-level state reported by the exchange.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::MarketId;
use crate::Price;

/// Balance of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

/// Perpetual position in one market (one-way mode).
///
/// `size` is signed: positive long, negative short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market: MarketId,
    pub size: Decimal,
    pub entry_price: Price,
    pub unrealized_pnl: Decimal,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}

/// Funding settled against a perpetual position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub market: MarketId,
    /// Signed: positive received, negative paid.
    pub amount: Decimal,
    pub rate: Decimal,
    /// Unix milliseconds.
    pub timestamp: u64,
}
