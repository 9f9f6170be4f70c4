//! WebSocket message types.

use std::fmt;

use lighter_core::MarketId;
use serde::{Deserialize, Serialize};

/// Reply to a server `{"type":"ping"}`.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

// ============================================================================
// Channels and subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    OrderBook,
    Trades,
    Orders,
    Fills,
    Positions,
    Funding,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OrderBook => "orderbook",
            Self::Trades => "trades",
            Self::Orders => "orders",
            Self::Fills => "fills",
            Self::Positions => "positions",
            Self::Funding => "funding",
        }
    }

    /// Parse a channel name. Accepts the `name:id` form the venue uses on
    /// data frames.
    pub fn from_name(name: &str) -> Option<Self> {
        let base = name.split(':').next().unwrap_or(name);
        match base {
            "orderbook" | "order_book" => Some(Self::OrderBook),
            "trades" | "trade" => Some(Self::Trades),
            "orders" | "account_orders" => Some(Self::Orders),
            "fills" => Some(Self::Fills),
            "positions" => Some(Self::Positions),
            "funding" => Some(Self::Funding),
            _ => None,
        }
    }

    /// Private channels need an auth token.
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Self::Orders | Self::Fills | Self::Positions | Self::Funding
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    Market { channel: Channel, market: MarketId },
    Account { channel: Channel, account_index: u64 },
}

impl Subscription {
    pub fn order_book(market: MarketId) -> Self {
        Self::Market {
            channel: Channel::OrderBook,
            market,
        }
    }

    pub fn trades(market: MarketId) -> Self {
        Self::Market {
            channel: Channel::Trades,
            market,
        }
    }

    pub fn orders(account_index: u64) -> Self {
        Self::Account {
            channel: Channel::Orders,
            account_index,
        }
    }

    pub fn fills(account_index: u64) -> Self {
        Self::Account {
            channel: Channel::Fills,
            account_index,
        }
    }

    pub fn positions(account_index: u64) -> Self {
        Self::Account {
            channel: Channel::Positions,
            account_index,
        }
    }

    pub fn funding(account_index: u64) -> Self {
        Self::Account {
            channel: Channel::Funding,
            account_index,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Market { channel, .. } | Self::Account { channel, .. } => *channel,
        }
    }

    pub fn is_private(&self) -> bool {
        self.channel().is_private()
    }

    /// Authenticated account this subscription counts against.
    pub fn account(&self) -> Option<u64> {
        match self {
            Self::Account { account_index, .. } if self.is_private() => Some(*account_index),
            _ => None,
        }
    }

    pub fn request(&self, method: &str, auth: Option<&str>) -> WsRequest {
        let mut req = WsRequest {
            method: method.to_string(),
            channel: Some(self.channel().name().to_string()),
            market_id: None,
            account_index: None,
            auth: None,
        };
        match self {
            Self::Market { market, .. } => req.market_id = Some(market.0),
            Self::Account { account_index, .. } => {
                req.account_index = Some(*account_index);
                if self.is_private() {
                    req.auth = auth.map(str::to_string);
                }
            }
        }
        req
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market { channel, market } => write!(f, "{channel}:{market}"),
            Self::Account {
                channel,
                account_index,
            } => write!(f, "{channel}:{account_index}"),
        }
    }
}

// ============================================================================
// Outgoing
// ============================================================================

/// Client request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WsRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl WsRequest {
    pub fn ping() -> Self {
        Self {
            method: "ping".to_string(),
            channel: None,
            market_id: None,
            account_index: None,
            auth: None,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// Inbound frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WsMessage {
    Channel(ChannelMessage),
    Control(ControlMessage),
}

/// Frame carrying a channel name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ChannelMessage {
    pub fn channel_kind(&self) -> Option<Channel> {
        Channel::from_name(&self.channel)
    }

    /// Subscription acknowledgement rather than data.
    pub fn is_ack(&self) -> bool {
        matches!(
            self.kind.as_deref(),
            Some("subscribed" | "unsubscribed")
        )
    }
}

/// Frame without a channel: ping/pong, greetings and errors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlMessage {
    #[serde(default, rename = "type", alias = "method")]
    pub kind: Option<String>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl ControlMessage {
    pub fn is_ping(&self) -> bool {
        self.kind.as_deref() == Some("ping")
    }

    pub fn is_pong(&self) -> bool {
        self.kind.as_deref() == Some("pong")
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| {
            e.get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_public_subscribe_frame() {
        let text = Subscription::order_book(MarketId(3))
            .request("subscribe", Some("ignored"))
            .to_text()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"method": "subscribe", "channel": "orderbook", "market_id": 3})
        );
    }

    #[test]
    fn test_private_subscribe_carries_auth() {
        let sub = Subscription::orders(42);
        assert!(sub.is_private());
        assert_eq!(sub.account(), Some(42));

        let value = serde_json::to_value(sub.request("subscribe", Some("tok"))).unwrap();
        assert_eq!(
            value,
            json!({"method": "subscribe", "channel": "orders", "account_index": 42, "auth": "tok"})
        );
    }

    #[test]
    fn test_parse_data_frame() {
        let raw = r#"{"channel":"orderbook:0","data":{"market_id":0,"bids":[]}}"#;
        match serde_json::from_str::<WsMessage>(raw).unwrap() {
            WsMessage::Channel(msg) => {
                assert_eq!(msg.channel_kind(), Some(Channel::OrderBook));
                assert!(!msg.is_ack());
                assert_eq!(msg.data["market_id"], 0);
            }
            other => panic!("expected channel message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        let ping: WsMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, WsMessage::Control(ref c) if c.is_ping()));

        let pong: WsMessage = serde_json::from_str(r#"{"method":"pong"}"#).unwrap();
        assert!(matches!(pong, WsMessage::Control(ref c) if c.is_pong()));

        let err: WsMessage =
            serde_json::from_str(r#"{"error":{"code":30003,"message":"Too Many Subscriptions"}}"#)
                .unwrap();
        match err {
            WsMessage::Control(c) => {
                assert_eq!(c.error_message().as_deref(), Some("Too Many Subscriptions"))
            }
            other => panic!("expected control, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_not_data() {
        let raw = r#"{"type":"subscribed","channel":"orders:7"}"#;
        match serde_json::from_str::<WsMessage>(raw).unwrap() {
            WsMessage::Channel(msg) => assert!(msg.is_ack()),
            other => panic!("expected channel ack, got {other:?}"),
        }
    }
}
