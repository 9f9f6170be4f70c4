//! Market identification and trading rules.
//!
//! Lighter identifies markets by a numeric index. The listing endpoint
//! supplies the symbol and the increments used to quantize order intents
//! and to scale prices/amounts into wire integers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::order::OrderSide;
use crate::{Price, Size};

/// Exchange market index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(pub u32);

impl MarketId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Market specification from the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSpec {
    pub market_id: MarketId,

    /// Exchange symbol (e.g. "ETH").
    pub symbol: String,

    pub base_asset: String,
    pub quote_asset: String,

    /// Minimum price increment.
    pub tick_size: Price,

    /// Minimum amount increment.
    pub step_size: Size,

    /// Minimum order amount.
    pub min_order_size: Size,

    pub is_active: bool,
}

impl MarketSpec {
    /// Decimal places of the price wire integer, implied by the tick size.
    pub fn price_decimals(&self) -> u32 {
        self.tick_size.0.normalize().scale()
    }

    /// Decimal places of the amount wire integer, implied by the step size.
    pub fn size_decimals(&self) -> u32 {
        self.step_size.0.normalize().scale()
    }

    pub fn to_wire_price(&self, price: Price) -> Result<i64> {
        price.to_wire(self.price_decimals())
    }

    pub fn to_wire_size(&self, size: Size) -> Result<i64> {
        size.to_wire(self.size_decimals())
    }

    pub fn from_wire_price(&self, raw: i64) -> Price {
        Price::from_wire(raw, self.price_decimals())
    }

    pub fn from_wire_size(&self, raw: i64) -> Size {
        Size::from_wire(raw, self.size_decimals())
    }

    /// Snap a price onto the tick grid, away from crossing the spread:
    /// buys round down, sells round up.
    pub fn quantize_price(&self, price: Price, side: OrderSide) -> Price {
        match side {
            OrderSide::Buy => price.floor_to_tick(self.tick_size),
            OrderSide::Sell => price.ceil_to_tick(self.tick_size),
        }
    }

    pub fn quantize_size(&self, size: Size) -> Size {
        size.floor_to_step(self.step_size)
    }

    /// Reject amounts that fall below the minimum after quantization.
    pub fn validate_size(&self, size: Size) -> Result<Size> {
        let quantized = self.quantize_size(size);
        if quantized < self.min_order_size || quantized.is_zero() {
            return Err(CoreError::InvalidSize(format!(
                "{size} below minimum {} for market {}",
                self.min_order_size, self.market_id
            )));
        }
        Ok(quantized)
    }
}
