//! Decoding of private channel frames.

use lighter_core::{Fill, FundingPayment, MarketId, OrderState, OrderUpdate, Position, Price, Size};
use lighter_ws::{Channel, ChannelMessage};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::AccountResult;
use crate::stream::UserEvent;

#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    order_index: u64,
    #[serde(default)]
    client_order_index: Option<u64>,
    market_id: u32,
    status: String,
    /// Absent on older payloads; the timestamp orders them instead.
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(default)]
    filled_amount: Option<Decimal>,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawFill {
    trade_id: u64,
    order_index: u64,
    market_id: u32,
    price: Decimal,
    #[serde(alias = "amount")]
    size: Decimal,
    #[serde(default)]
    fee: Decimal,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    market_id: u32,
    size: Decimal,
    #[serde(default)]
    entry_price: Decimal,
    #[serde(default)]
    unrealized_pnl: Decimal,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawFunding {
    market_id: u32,
    #[serde(alias = "payment")]
    amount: Decimal,
    #[serde(default)]
    rate: Decimal,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn items<T: DeserializeOwned>(data: &serde_json::Value) -> AccountResult<Vec<T>> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_value(data.clone())? {
        OneOrMany::Many(v) => v,
        OneOrMany::One(t) => vec![t],
    })
}

/// Decode one private frame. Public channels yield no events.
pub fn parse_user_message(msg: &ChannelMessage) -> AccountResult<Vec<UserEvent>> {
    let events = match msg.channel_kind() {
        Some(Channel::Orders) => items::<RawOrderUpdate>(&msg.data)?
            .into_iter()
            .filter_map(|raw| {
                let Some(state) = OrderState::from_exchange_status(&raw.status) else {
                    warn!(order_index = raw.order_index, status = %raw.status, "Unknown order status");
                    return None;
                };
                Some(UserEvent::Order(OrderUpdate {
                    order_id: raw.order_index,
                    client_order_index: raw.client_order_index,
                    market: MarketId(raw.market_id),
                    state,
                    sequence: raw.sequence.unwrap_or(raw.timestamp),
                    filled_amount: raw.filled_amount.map(Size::new),
                    timestamp: raw.timestamp,
                }))
            })
            .collect(),
        Some(Channel::Fills) => items::<RawFill>(&msg.data)?
            .into_iter()
            .map(|raw| {
                UserEvent::Fill(Fill {
                    order_id: raw.order_index,
                    trade_id: raw.trade_id,
                    market: MarketId(raw.market_id),
                    price: Price::new(raw.price),
                    amount: Size::new(raw.size),
                    fee: raw.fee,
                    timestamp: raw.timestamp,
                })
            })
            .collect(),
        Some(Channel::Positions) => items::<RawPosition>(&msg.data)?
            .into_iter()
            .map(|raw| {
                UserEvent::Position(Position {
                    market: MarketId(raw.market_id),
                    size: raw.size,
                    entry_price: Price::new(raw.entry_price),
                    unrealized_pnl: raw.unrealized_pnl,
                    timestamp: raw.timestamp,
                })
            })
            .collect(),
        Some(Channel::Funding) => items::<RawFunding>(&msg.data)?
            .into_iter()
            .map(|raw| {
                UserEvent::Funding(FundingPayment {
                    market: MarketId(raw.market_id),
                    amount: raw.amount,
                    rate: raw.rate,
                    timestamp: raw.timestamp,
                })
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(events)
}
