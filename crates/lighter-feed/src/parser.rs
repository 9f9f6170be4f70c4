//! Decoding of public channel frames.

use lighter_core::{BookLevel, MarketId, OrderSide, Price, Size};
use lighter_ws::{Channel, ChannelMessage};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book::BookDiff;
use crate::error::{FeedError, FeedResult};

/// Trade printed on a public market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicTrade {
    pub market: MarketId,
    pub trade_id: u64,
    pub price: Price,
    pub size: Size,
    /// Taker side.
    pub side: OrderSide,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Diff(BookDiff),
    Trades(Vec<PublicTrade>),
}

#[derive(Debug, Deserialize)]
struct RawDiff {
    #[serde(default)]
    market_id: Option<u32>,
    #[serde(default)]
    first_update_id: Option<u64>,
    #[serde(default, alias = "update_id")]
    last_update_id: Option<u64>,
    #[serde(default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    asks: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    trade_id: u64,
    #[serde(default)]
    market_id: Option<u32>,
    price: Decimal,
    size: Decimal,
    is_buy: bool,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTrades {
    Many(Vec<RawTrade>),
    One(RawTrade),
}

/// Market id from the `name:id` channel suffix.
fn channel_market(channel: &str) -> Option<u32> {
    channel.split_once(':')?.1.parse().ok()
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<BookLevel> {
    raw.into_iter()
        .map(|(p, s)| BookLevel::new(Price::new(p), Size::new(s)))
        .collect()
}

/// Decode an order book or trades frame. Other channels yield `None`.
pub fn parse_feed_message(msg: &ChannelMessage) -> FeedResult<Option<FeedMessage>> {
    match msg.channel_kind() {
        Some(Channel::OrderBook) => parse_diff(msg).map(|d| Some(FeedMessage::Diff(d))),
        Some(Channel::Trades) => parse_trades(msg).map(|t| Some(FeedMessage::Trades(t))),
        _ => Ok(None),
    }
}

fn parse_diff(msg: &ChannelMessage) -> FeedResult<BookDiff> {
    let raw: RawDiff = serde_json::from_value(msg.data.clone())?;
    let market = raw
        .market_id
        .or_else(|| channel_market(&msg.channel))
        .ok_or_else(|| FeedError::Parse(format!("no market id on {}", msg.channel)))?;
    let last = raw
        .last_update_id
        .ok_or_else(|| FeedError::Parse("order book diff without update id".to_string()))?;
    Ok(BookDiff {
        market: MarketId(market),
        first_update_id: raw.first_update_id.unwrap_or(last),
        last_update_id: last,
        bids: levels(raw.bids),
        asks: levels(raw.asks),
        timestamp: raw.timestamp,
    })
}

fn parse_trades(msg: &ChannelMessage) -> FeedResult<Vec<PublicTrade>> {
    let raw = match serde_json::from_value(msg.data.clone())? {
        RawTrades::Many(v) => v,
        RawTrades::One(t) => vec![t],
    };
    let fallback = channel_market(&msg.channel);
    raw.into_iter()
        .map(|t| {
            let market = t
                .market_id
                .or(fallback)
                .ok_or_else(|| FeedError::Parse(format!("no market id on {}", msg.channel)))?;
            Ok(PublicTrade {
                market: MarketId(market),
                trade_id: t.trade_id,
                price: Price::new(t.price),
                size: Size::new(t.size),
                side: if t.is_buy {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                timestamp: t.timestamp,
            })
        })
        .collect()
}
