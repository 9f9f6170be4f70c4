//! Typed Lighter REST calls.
//!
//! Every call goes through the `Dispatcher`, so each one is budgeted in
//! its endpoint's weight class.

use std::collections::BTreeMap;
use std::sync::Arc;

use lighter_auth::{NonceSource, SignedTransaction, SigningError, SigningResult};
use lighter_core::{
    Balance, BookLevel, BookSnapshot, BoxFuture, Fill, FundingPayment, MarketId, MarketSpec,
    OrderState, Position, Price, Size,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::endpoints;
use crate::error::{RestError, RestResult};
use crate::rate_limit::{BudgetPermit, WeightClass};
use crate::transport::HttpRequest;

fn decode<T: DeserializeOwned>(path: &str, body: &str) -> RestResult<T> {
    serde_json::from_str(body).map_err(|e| RestError::Decode(format!("{path}: {e}")))
}

/// Envelope `code` field; anything other than 200 is a remote rejection
/// even when the HTTP status was 2xx.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: Option<i64>,
}

fn check_code(body: &str) -> RestResult<()> {
    match serde_json::from_str::<Envelope>(body) {
        Ok(Envelope { code: Some(code) }) if code != 200 => Err(RestError::Remote {
            status: 400,
            body: body.to_string(),
        }),
        _ => Ok(()),
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawMarket {
    market_id: u32,
    symbol: String,
    #[serde(default)]
    base_asset: String,
    #[serde(default)]
    quote_asset: String,
    tick_size: Decimal,
    step_size: Decimal,
    min_order_size: Decimal,
    #[serde(default)]
    status: Option<String>,
}

impl From<RawMarket> for MarketSpec {
    fn from(raw: RawMarket) -> Self {
        let base_asset = if raw.base_asset.is_empty() {
            raw.symbol.clone()
        } else {
            raw.base_asset
        };
        Self {
            market_id: MarketId(raw.market_id),
            symbol: raw.symbol,
            base_asset,
            quote_asset: raw.quote_asset,
            tick_size: Price::new(raw.tick_size),
            step_size: Size::new(raw.step_size),
            min_order_size: Size::new(raw.min_order_size),
            is_active: raw.status.as_deref().map_or(true, |s| s == "active"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    order_books: Vec<RawMarket>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    last_update_id: u64,
    #[serde(default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    asks: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    timestamp: u64,
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<BookLevel> {
    raw.into_iter()
        .map(|(p, s)| BookLevel::new(Price::new(p), Size::new(s)))
        .collect()
}

/// Result of a `sendTx` submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxReceipt {
    #[serde(default)]
    pub tx_hash: Option<String>,
    /// Exchange order index, when the venue returns it synchronously.
    #[serde(default)]
    pub order_index: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: u64,
}

/// Order as reported by the order and active-order endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeOrder {
    pub order_index: u64,
    #[serde(default)]
    pub client_order_index: Option<u64>,
    pub market_id: u32,
    pub status: String,
    #[serde(default)]
    pub filled_amount: Option<Decimal>,
    #[serde(default)]
    pub timestamp: u64,
}

impl ExchangeOrder {
    pub fn state(&self) -> Option<OrderState> {
        OrderState::from_exchange_status(&self.status)
    }
}

#[derive(Debug, Deserialize)]
struct ActiveOrdersResponse {
    #[serde(default)]
    orders: Vec<ExchangeOrder>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    total: Decimal,
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    market_id: u32,
    size: Decimal,
    entry_price: Decimal,
    #[serde(default)]
    unrealized_pnl: Decimal,
    #[serde(default)]
    timestamp: u64,
}

impl From<RawPosition> for Position {
    fn from(raw: RawPosition) -> Self {
        Self {
            market: MarketId(raw.market_id),
            size: raw.size,
            entry_price: Price::new(raw.entry_price),
            unrealized_pnl: raw.unrealized_pnl,
            timestamp: raw.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(default)]
    balances: BTreeMap<String, RawBalance>,
    #[serde(default)]
    positions: Vec<RawPosition>,
}

/// Balances and positions of the trading account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub balances: Vec<Balance>,
    pub positions: Vec<Position>,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    trade_id: u64,
    order_index: u64,
    market_id: u32,
    price: Decimal,
    size: Decimal,
    #[serde(default)]
    fee: Decimal,
    #[serde(default)]
    timestamp: u64,
}

impl From<RawTrade> for Fill {
    fn from(raw: RawTrade) -> Self {
        Self {
            order_id: raw.order_index,
            trade_id: raw.trade_id,
            market: MarketId(raw.market_id),
            price: Price::new(raw.price),
            amount: Size::new(raw.size),
            fee: raw.fee,
            timestamp: raw.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TradesResponse {
    #[serde(default)]
    trades: Vec<RawTrade>,
}

#[derive(Debug, Deserialize)]
struct RawFunding {
    market_id: u32,
    amount: Decimal,
    #[serde(default)]
    rate: Decimal,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct FundingResponse {
    #[serde(default)]
    fundings: Vec<RawFunding>,
}

// ============================================================================
// Client
// ============================================================================

/// Typed access to the Lighter REST API.
#[derive(Clone)]
pub struct LighterApi {
    dispatcher: Arc<Dispatcher>,
}

impl LighterApi {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn get(&self, request: HttpRequest) -> RestResult<String> {
        let response = self.dispatcher.submit(request).await?;
        check_code(&response.body)?;
        Ok(response.body)
    }

    /// Market listing with trading rules.
    pub async fn markets(&self) -> RestResult<Vec<MarketSpec>> {
        let body = self.get(HttpRequest::get(endpoints::ORDER_BOOKS)).await?;
        let parsed: MarketsResponse = decode(endpoints::ORDER_BOOKS, &body)?;
        info!(count = parsed.order_books.len(), "Fetched market listing");
        Ok(parsed.order_books.into_iter().map(MarketSpec::from).collect())
    }

    pub async fn order_book_snapshot(&self, market: MarketId) -> RestResult<BookSnapshot> {
        let body = self
            .get(HttpRequest::get(endpoints::ORDER_BOOK_DETAILS).query("market_id", market))
            .await?;
        let raw: RawSnapshot = decode(endpoints::ORDER_BOOK_DETAILS, &body)?;
        debug!(%market, last_update_id = raw.last_update_id, "Fetched book snapshot");
        Ok(BookSnapshot {
            market,
            last_update_id: raw.last_update_id,
            bids: levels(raw.bids),
            asks: levels(raw.asks),
            timestamp: raw.timestamp,
        })
    }

    fn send_tx_request(tx: &SignedTransaction) -> RestResult<HttpRequest> {
        Ok(HttpRequest::post(endpoints::SEND_TX)
            .form("tx_type", tx.tx_type.code())
            .form("tx_info", tx.tx_info()?))
    }

    /// Reserve transaction budget ahead of signing.
    pub fn reserve_tx(&self) -> RestResult<BudgetPermit> {
        self.dispatcher.reserve(WeightClass::Transaction)
    }

    /// Submit a signed transaction using previously reserved budget.
    pub async fn send_tx_reserved(
        &self,
        permit: BudgetPermit,
        tx: &SignedTransaction,
    ) -> RestResult<TxReceipt> {
        let request = Self::send_tx_request(tx)?;
        let response = self.dispatcher.submit_reserved(permit, request).await?;
        check_code(&response.body)?;
        decode(endpoints::SEND_TX, &response.body)
    }

    pub async fn send_tx(&self, tx: &SignedTransaction) -> RestResult<TxReceipt> {
        let permit = self.reserve_tx()?;
        self.send_tx_reserved(permit, tx).await
    }

    /// Submit several signed transactions in one request.
    pub async fn send_tx_batch(&self, txs: &[SignedTransaction]) -> RestResult<TxReceipt> {
        let permit = self.reserve_tx()?;
        self.send_tx_batch_reserved(permit, txs).await
    }

    pub async fn send_tx_batch_reserved(
        &self,
        permit: BudgetPermit,
        txs: &[SignedTransaction],
    ) -> RestResult<TxReceipt> {
        let types: Vec<u8> = txs.iter().map(|t| t.tx_type.code()).collect();
        let infos = txs
            .iter()
            .map(SignedTransaction::tx_info)
            .collect::<SigningResult<Vec<_>>>()?;
        let request = HttpRequest::post(endpoints::SEND_TX_BATCH)
            .form("tx_types", serde_json::to_string(&types)?)
            .form("tx_infos", serde_json::to_string(&infos)?);

        let response = self.dispatcher.submit_reserved(permit, request).await?;
        check_code(&response.body)?;
        decode(endpoints::SEND_TX_BATCH, &response.body)
    }

    pub async fn next_nonce(&self, account_index: u64, api_key_index: u8) -> RestResult<u64> {
        let body = self
            .get(
                HttpRequest::get(endpoints::NEXT_NONCE)
                    .query("account_index", account_index)
                    .query("api_key_index", api_key_index),
            )
            .await?;
        let parsed: NonceResponse = decode(endpoints::NEXT_NONCE, &body)?;
        Ok(parsed.nonce)
    }

    /// Order status by exchange order index. `None` if the exchange does
    /// not know the order.
    pub async fn order_status(
        &self,
        account_index: u64,
        order_index: u64,
    ) -> RestResult<Option<ExchangeOrder>> {
        self.query_order(
            HttpRequest::get(endpoints::ORDER)
                .query("account_index", account_index)
                .query("order_index", order_index),
        )
        .await
    }

    /// Order status by client order index, for orders never acknowledged.
    pub async fn order_status_by_client_index(
        &self,
        account_index: u64,
        client_order_index: u64,
    ) -> RestResult<Option<ExchangeOrder>> {
        self.query_order(
            HttpRequest::get(endpoints::ORDER)
                .query("account_index", account_index)
                .query("client_order_index", client_order_index),
        )
        .await
    }

    async fn query_order(&self, request: HttpRequest) -> RestResult<Option<ExchangeOrder>> {
        match self.get(request).await {
            Ok(body) => Ok(Some(decode(endpoints::ORDER, &body)?)),
            Err(e) if e.is_order_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn active_orders(
        &self,
        account_index: u64,
        market: Option<MarketId>,
    ) -> RestResult<Vec<ExchangeOrder>> {
        let mut request =
            HttpRequest::get(endpoints::ACTIVE_ORDERS).query("account_index", account_index);
        if let Some(market) = market {
            request = request.query("market_id", market);
        }
        let body = self.get(request).await?;
        let parsed: ActiveOrdersResponse = decode(endpoints::ACTIVE_ORDERS, &body)?;
        Ok(parsed.orders)
    }

    pub async fn account(&self, account_index: u64) -> RestResult<AccountInfo> {
        let body = self
            .get(
                HttpRequest::get(endpoints::ACCOUNT)
                    .query("by", "index")
                    .query("value", account_index),
            )
            .await?;
        let raw: RawAccount = decode(endpoints::ACCOUNT, &body)?;
        Ok(AccountInfo {
            balances: raw
                .balances
                .into_iter()
                .map(|(asset, b)| Balance {
                    asset,
                    total: b.total,
                    available: b.available,
                })
                .collect(),
            positions: raw.positions.into_iter().map(Position::from).collect(),
        })
    }

    /// Fills for the account, optionally restricted to one order.
    pub async fn trades(
        &self,
        account_index: u64,
        order_index: Option<u64>,
    ) -> RestResult<Vec<Fill>> {
        let mut request = HttpRequest::get(endpoints::TRADES).query("account_index", account_index);
        if let Some(order_index) = order_index {
            request = request.query("order_index", order_index);
        }
        let body = self.get(request).await?;
        let parsed: TradesResponse = decode(endpoints::TRADES, &body)?;
        Ok(parsed.trades.into_iter().map(Fill::from).collect())
    }

    pub async fn positions(&self, account_index: u64) -> RestResult<Vec<Position>> {
        let body = self
            .get(HttpRequest::get(endpoints::POSITIONS).query("account_index", account_index))
            .await?;
        let parsed: PositionsResponse = decode(endpoints::POSITIONS, &body)?;
        Ok(parsed.positions.into_iter().map(Position::from).collect())
    }

    pub async fn funding_payments(&self, account_index: u64) -> RestResult<Vec<FundingPayment>> {
        let body = self
            .get(HttpRequest::get(endpoints::FUNDING).query("account_index", account_index))
            .await?;
        let parsed: FundingResponse = decode(endpoints::FUNDING, &body)?;
        Ok(parsed
            .fundings
            .into_iter()
            .map(|f| FundingPayment {
                market: MarketId(f.market_id),
                amount: f.amount,
                rate: f.rate,
                timestamp: f.timestamp,
            })
            .collect())
    }

    /// Exchange health check.
    pub async fn health(&self) -> RestResult<()> {
        self.get(HttpRequest::get(endpoints::STATUS)).await.map(|_| ())
    }
}

impl NonceSource for LighterApi {
    fn fetch_next_nonce(
        &self,
        account_index: u64,
        api_key_index: u8,
    ) -> BoxFuture<'_, SigningResult<u64>> {
        Box::pin(async move {
            self.next_nonce(account_index, api_key_index)
                .await
                .map_err(|e| SigningError::NonceSync(e.to_string()))
        })
    }
}
