//! Signed-transaction wire types.
//!
//! A transaction is signed once. A resend after a timeout reuses the same
//! `SignedTransaction`, so the exchange sees the same nonce and bytes.

use alloy::primitives::{keccak256, B256};
use lighter_core::{MarketId, MarketSpec, OrderIntent, TxType};
use serde::{Deserialize, Serialize};

use crate::error::{SigningError, SigningResult};

/// Create-order parameters, prices and amounts already wire-scaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderParams {
    pub market_index: u32,
    pub client_order_index: u64,
    pub base_amount: i64,
    pub price: i64,
    pub is_ask: bool,
    pub order_type: u8,
    pub time_in_force: u8,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrderParams {
    pub market_index: u32,
    pub order_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAllParams {
    pub time_in_force: u8,
    /// Unix milliseconds the cancel-all applies to.
    pub time: u64,
}

/// Transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxParams {
    CreateOrder(CreateOrderParams),
    CancelOrder(CancelOrderParams),
    CancelAll(CancelAllParams),
}

impl TxParams {
    /// Build create-order params from an intent, quantizing to the market's
    /// increments before scaling.
    pub fn for_order(intent: &OrderIntent, spec: &MarketSpec) -> SigningResult<Self> {
        let price = spec.quantize_price(intent.price, intent.side);
        let amount = spec.validate_size(intent.amount)?;

        Ok(Self::CreateOrder(CreateOrderParams {
            market_index: intent.market.index(),
            client_order_index: intent.client_order_id.client_order_index(),
            base_amount: spec.to_wire_size(amount)?,
            price: spec.to_wire_price(price)?,
            is_ask: !intent.side.is_buy(),
            order_type: intent.order_type.wire_code(),
            time_in_force: intent.tif.wire_code(),
            reduce_only: intent.reduce_only,
        }))
    }

    pub fn cancel(market: MarketId, order_index: u64) -> Self {
        Self::CancelOrder(CancelOrderParams {
            market_index: market.index(),
            order_index,
        })
    }

    pub fn cancel_all(time: u64) -> Self {
        Self::CancelAll(CancelAllParams {
            time_in_force: lighter_core::TimeInForce::ImmediateOrCancel.wire_code(),
            time,
        })
    }

    pub fn tx_type(&self) -> TxType {
        match self {
            Self::CreateOrder(_) => TxType::CreateOrder,
            Self::CancelOrder(_) => TxType::CancelOrder,
            Self::CancelAll(_) => TxType::CancelAllOrders,
        }
    }

    /// Digest the backend signs.
    ///
    /// `keccak256(msgpack(params) || tx_type || nonce_be || account_be || api_key_index)`
    pub fn digest(&self, nonce: u64, account_index: u64, api_key_index: u8) -> SigningResult<B256> {
        let mut data = rmp_serde::to_vec_named(self)
            .map_err(|e| SigningError::Serialization(e.to_string()))?;
        data.push(self.tx_type().code());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&account_index.to_be_bytes());
        data.push(api_key_index);
        Ok(keccak256(&data))
    }
}

/// Immutable signed payload ready for `sendTx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx_type: TxType,
    pub nonce: u64,
    pub account_index: u64,
    pub api_key_index: u8,
    pub params: TxParams,
    /// Hex signature with 0x prefix.
    pub signature: String,
}

#[derive(Serialize)]
struct TxInfo<'a> {
    account_index: u64,
    api_key_index: u8,
    nonce: u64,
    #[serde(flatten)]
    params: &'a TxParams,
    sig: &'a str,
}

impl SignedTransaction {
    /// JSON `tx_info` field of the `sendTx` form.
    pub fn tx_info(&self) -> SigningResult<String> {
        serde_json::to_string(&TxInfo {
            account_index: self.account_index,
            api_key_index: self.api_key_index,
            nonce: self.nonce,
            params: &self.params,
            sig: &self.signature,
        })
        .map_err(|e| SigningError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighter_core::{OrderSide, Price, Size};
    use rust_decimal_macros::dec;

    fn spec() -> MarketSpec {
        MarketSpec {
            market_id: MarketId(1),
            symbol: "BTC".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDC".to_string(),
            tick_size: Price::new(dec!(0.1)),
            step_size: Size::new(dec!(0.00001)),
            min_order_size: Size::new(dec!(0.0002)),
            is_active: true,
        }
    }

    #[test]
    fn test_for_order_scales_and_quantizes() {
        let intent = OrderIntent::limit(
            MarketId(1),
            OrderSide::Sell,
            Price::new(dec!(65000.04)),
            Size::new(dec!(0.012345)),
        );
        let TxParams::CreateOrder(p) = TxParams::for_order(&intent, &spec()).unwrap() else {
            panic!("expected create order");
        };

        assert_eq!(p.price, 650_001); // sells round up to 65000.1
        assert_eq!(p.base_amount, 1_234);
        assert!(p.is_ask);
        assert_eq!(p.order_type, 0);
        assert_eq!(p.time_in_force, 1);
        assert_eq!(p.client_order_index, intent.client_order_id.client_order_index());
    }

    #[test]
    fn test_for_order_rejects_dust() {
        let intent = OrderIntent::limit(
            MarketId(1),
            OrderSide::Buy,
            Price::new(dec!(65000)),
            Size::new(dec!(0.0001)),
        );
        assert!(matches!(
            TxParams::for_order(&intent, &spec()),
            Err(SigningError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_digest_binds_nonce_and_key() {
        let params = TxParams::cancel(MarketId(1), 77);
        let base = params.digest(10, 5, 3).unwrap();

        assert_eq!(base, params.digest(10, 5, 3).unwrap());
        assert_ne!(base, params.digest(11, 5, 3).unwrap());
        assert_ne!(base, params.digest(10, 6, 3).unwrap());
        assert_ne!(base, params.digest(10, 5, 4).unwrap());
    }

    #[test]
    fn test_tx_info_fields() {
        let tx = SignedTransaction {
            tx_type: TxType::CancelOrder,
            nonce: 9,
            account_index: 5,
            api_key_index: 3,
            params: TxParams::cancel(MarketId(1), 77),
            signature: "0xabc".to_string(),
        };
        let info: serde_json::Value = serde_json::from_str(&tx.tx_info().unwrap()).unwrap();

        assert_eq!(info["nonce"], 9);
        assert_eq!(info["market_index"], 1);
        assert_eq!(info["order_index"], 77);
        assert_eq!(info["sig"], "0xabc");
    }
}
