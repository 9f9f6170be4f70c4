//! Order book snapshot types shared by the REST and stream layers.

use serde::{Deserialize, Serialize};

use crate::market::MarketId;
use crate::{Price, Size};

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Size,
}

impl BookLevel {
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

/// Full book state as returned by the snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub market: MarketId,
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// Unix milliseconds.
    pub timestamp: u64,
}
