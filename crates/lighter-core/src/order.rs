//! Order-related types and identifiers.
//!
//! Provides order side, type, time-in-force, the locally assigned client
//! order id and the intent the trading engine hands to the connector.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::market::MarketId;
use crate::{Price, Size};

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    /// Numeric code used in create-order transactions.
    pub fn wire_code(&self) -> u8 {
        match self {
            Self::Limit => 0,
            Self::Market => 1,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Time-in-force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
    #[default]
    #[serde(rename = "GTT")]
    GoodTillTime,
    #[serde(rename = "POST_ONLY")]
    PostOnly,
}

impl TimeInForce {
    pub fn wire_code(&self) -> u8 {
        match self {
            Self::ImmediateOrCancel => 0,
            Self::GoodTillTime => 1,
            Self::PostOnly => 2,
        }
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImmediateOrCancel => write!(f, "IOC"),
            Self::GoodTillTime => write!(f, "GTT"),
            Self::PostOnly => write!(f, "POST_ONLY"),
        }
    }
}

/// Locally assigned client order id.
///
/// This is the only stable key for an order until the exchange
/// acknowledges it. The exchange itself only carries the numeric
/// `client_order_index` derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `lt_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("lt_{ts}_{uuid_short}"))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 63-bit index sent to the exchange in place of the string id.
    ///
    /// FNV-1a over the id bytes, top bit cleared. Deterministic across
    /// restarts so reconciliation can match exchange orders back to ids.
    pub fn client_order_index(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let hash = self
            .0
            .bytes()
            .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
        hash & (u64::MAX >> 1)
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the trading engine asks the connector to place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: ClientOrderId,
    pub market: MarketId,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(default)]
    pub tif: TimeInForce,
    /// Limit price, or the worst acceptable price for market orders.
    pub price: Price,
    pub amount: Size,
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderIntent {
    /// Limit order resting until canceled (GTT).
    pub fn limit(market: MarketId, side: OrderSide, price: Price, amount: Size) -> Self {
        Self {
            client_order_id: ClientOrderId::new(),
            market,
            side,
            order_type: OrderType::Limit,
            tif: TimeInForce::GoodTillTime,
            price,
            amount,
            reduce_only: false,
        }
    }

    /// Market order; `worst_price` bounds slippage.
    pub fn market(market: MarketId, side: OrderSide, worst_price: Price, amount: Size) -> Self {
        Self {
            client_order_id: ClientOrderId::new(),
            market,
            side,
            order_type: OrderType::Market,
            tif: TimeInForce::ImmediateOrCancel,
            price: worst_price,
            amount,
            reduce_only: false,
        }
    }

    #[must_use]
    pub fn post_only(mut self) -> Self {
        self.tif = TimeInForce::PostOnly;
        self
    }

    #[must_use]
    pub fn with_client_order_id(mut self, id: ClientOrderId) -> Self {
        self.client_order_id = id;
        self
    }
}
