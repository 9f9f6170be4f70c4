//! Execution-related types for order lifecycle management.
//!
//! This module provides types for:
//! - The order state machine states and their legal transitions
//! - The locally tracked order record
//! - Exchange-originated fills and order-status updates

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::market::MarketId;
use crate::order::{ClientOrderId, OrderIntent, OrderSide, OrderType, TimeInForce};
use crate::{Price, Size};

// ============================================================================
// Order State
// ============================================================================

/// State of an order in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Signed and submitted (or about to be), not yet acknowledged.
    #[default]
    PendingCreate,
    /// Acknowledged and resting on the book.
    Open,
    /// Some amount filled, remainder resting.
    PartiallyFilled,
    /// Cancel submitted, not yet confirmed.
    PendingCancel,
    Filled,
    Canceled,
    /// Rejected by the exchange.
    Failed,
}

impl OrderState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }

    /// States from which a cancel request may be issued.
    #[must_use]
    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::PendingCreate | Self::Open | Self::PartiallyFilled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Same-state moves are not transitions and return false.
    #[must_use]
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (a, b) if *a == b => false,
            (Filled | Canceled | Failed, _) => false,
            (_, PendingCreate) => false,
            (PendingCreate, _) => true,
            (Open, PartiallyFilled | Filled | PendingCancel | Canceled) => true,
            (PartiallyFilled, Open | Filled | PendingCancel | Canceled) => true,
            (PendingCancel, Canceled | Filled | Failed) => true,
            _ => false,
        }
    }

    /// Map an exchange status string onto a local state.
    pub fn from_exchange_status(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "pending" => Some(Self::PendingCreate),
            "filled" => Some(Self::Filled),
            "partially_filled" => Some(Self::PartiallyFilled),
            "canceled" | "cancelled" | "expired" => Some(Self::Canceled),
            "rejected" | "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingCreate => "PENDING_CREATE",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Client Order
// ============================================================================

/// Tracked order for lifecycle management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOrder {
    pub client_order_id: ClientOrderId,
    /// Numeric correlation key carried by exchange events.
    pub client_order_index: u64,
    /// Exchange order index, known once acknowledged.
    pub exchange_order_id: Option<u64>,
    pub market: MarketId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub price: Price,
    pub amount: Size,
    pub filled_amount: Size,
    pub state: OrderState,
    /// Creation timestamp (Unix milliseconds).
    pub created_at: u64,
    /// Last state transition timestamp (Unix milliseconds).
    pub last_transition_at: u64,
    /// Highest order-status sequence applied.
    pub last_sequence: u64,
    /// Outcome unknown; a status query is in flight.
    pub reconciling: bool,
}

impl ClientOrder {
    #[must_use]
    pub fn from_intent(intent: &OrderIntent, now_ms: u64) -> Self {
        Self {
            client_order_index: intent.client_order_id.client_order_index(),
            client_order_id: intent.client_order_id.clone(),
            exchange_order_id: None,
            market: intent.market,
            side: intent.side,
            order_type: intent.order_type,
            tif: intent.tif,
            price: intent.price,
            amount: intent.amount,
            filled_amount: Size::ZERO,
            state: OrderState::PendingCreate,
            created_at: now_ms,
            last_transition_at: now_ms,
            last_sequence: 0,
            reconciling: false,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> Size {
        self.amount - self.filled_amount
    }

    #[must_use]
    pub fn is_fully_filled(&self) -> bool {
        self.filled_amount >= self.amount
    }
}

// ============================================================================
// Exchange Events
// ============================================================================

/// A single execution against one of our orders.
///
/// Fills are append-only; `trade_id` deduplicates retransmissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Exchange order index.
    pub order_id: u64,
    pub trade_id: u64,
    pub market: MarketId,
    pub price: Price,
    pub amount: Size,
    pub fee: rust_decimal::Decimal,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// Order-status change reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Exchange order index.
    pub order_id: u64,
    pub client_order_index: Option<u64>,
    pub market: MarketId,
    pub state: OrderState,
    /// Monotonic per-order sequence; highest wins.
    pub sequence: u64,
    /// Cumulative filled amount, when reported.
    pub filled_amount: Option<Size>,
    /// Unix milliseconds.
    pub timestamp: u64,
}
