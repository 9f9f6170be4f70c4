//! Spot connector.
//!
//! Wires the signer, the REST dispatcher, both WebSocket streams and the
//! order tracker into the contract the trading engine uses:
//! submit/cancel orders, subscribe to books and user events, query orders.
//!
//! Submission order matters:
//! 1. reserve transaction budget (refused requests never consume a nonce)
//! 2. sign (a signing failure never creates a tracked order)
//! 3. register the order in PENDING_CREATE
//! 4. send, then report the outcome to the tracker

use std::collections::HashMap;
use std::sync::Arc;

use lighter_account::{spawn_user_stream, AccountSource, UserEvent, UserStreamConfig, UserStreamHandle};
use lighter_auth::{
    spawn_token_refresher, KeyManager, LocalKeyBackend, SignedTransaction, Signer, SigningBackend,
    SystemClock, TxParams,
};
use lighter_core::{
    now_millis, Balance, ClientOrder, ClientOrderId, MarketId, MarketSpec, OrderIntent,
    OrderSide, Price, Size,
};
use lighter_feed::{spawn_book_stream, BookEvent, BookStreamHandle, OrderBookState, SnapshotSource};
use lighter_orders::{
    spawn_order_tracker, CancelOutcome, OrderEvent, OrderTrackerHandle, RestOrderQuery,
    SubmitOutcome, TrackerConfig,
};
use lighter_rest::{
    BudgetPermit, Dispatcher, HttpTransport, LighterApi, RateBudget, RestError, ReqwestTransport,
};
use lighter_ws::{BudgetLimits, ConnectionManager, Subscription, SubscriptionBudget};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, ConnectorResult};

/// Market orders are bounded 5% away from the book mid.
pub const MARKET_ORDER_SLIPPAGE_BPS: i64 = 500;

const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Worst acceptable price for a market order.
pub fn slippage_bound(mid: Price, side: OrderSide) -> Price {
    let slippage = Decimal::new(MARKET_ORDER_SLIPPAGE_BPS, 4);
    let factor = if side.is_buy() {
        Decimal::ONE + slippage
    } else {
        Decimal::ONE - slippage
    };
    Price::new(mid.inner() * factor)
}

/// How a failed transaction send is settled.
enum TxFailure {
    /// Never left the process; the nonce was handed back if still the latest.
    NotSent,
    /// The exchange may have applied it.
    Ambiguous,
    /// Rejected because the nonce sequence drifted; resync was attempted.
    NonceMismatch,
    Rejected(String),
}

pub struct SpotConnector {
    config: ConnectorConfig,
    api: LighterApi,
    signer: Arc<Signer>,
    markets: RwLock<HashMap<MarketId, MarketSpec>>,
    books: BookStreamHandle,
    user: UserStreamHandle,
    tracker: OrderTrackerHandle,
    public_ws: Arc<ConnectionManager>,
    private_ws: Arc<ConnectionManager>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpotConnector {
    /// Build a connector against the configured network with the key from
    /// `config.key`.
    pub fn connect(config: ConnectorConfig) -> ConnectorResult<Self> {
        let keys = Arc::new(KeyManager::load(&config.key)?);
        info!(identity = %keys.address(), "API key loaded");
        let transport = ReqwestTransport::new(config.rest_url(), config.request_timeout())
            .map_err(|e| ConnectorError::Config(format!("{e:?}")))?;
        Self::with_parts(
            config,
            Arc::new(transport),
            Arc::new(LocalKeyBackend::new(keys)),
        )
    }

    /// Build a connector over explicit transport and signing backends.
    ///
    /// Spawns the book stream, user stream and order tracker actors; must
    /// run inside a tokio runtime. Nothing touches the network until
    /// [`initialize`](Self::initialize) or [`start`](Self::start).
    pub fn with_parts(
        config: ConnectorConfig,
        transport: Arc<dyn HttpTransport>,
        backend: Arc<dyn SigningBackend>,
    ) -> ConnectorResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(transport, RateBudget::new(config.account_tier))
            .with_timeout(config.request_timeout());
        let api = LighterApi::new(Arc::new(dispatcher));

        let signer = Arc::new(Signer::with_clock(
            backend,
            config.account_index,
            config.api_key_index,
            config.auth_token_lifetime(),
            Arc::new(SystemClock),
        )?);

        // Per-IP limits are shared by both sessions
        let budget = Arc::new(SubscriptionBudget::new(
            BudgetLimits::default(),
            config.ws.budget_warn_fraction,
        ));
        let (public_tx, public_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (private_tx, private_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let public_ws = Arc::new(ConnectionManager::new(
            config.ws.connection(config.ws_url(), "public"),
            Arc::clone(&budget),
            public_tx,
        ));
        let private_ws = Arc::new(
            ConnectionManager::new(
                config.ws.connection(config.ws_url(), "private"),
                budget,
                private_tx,
            )
            .with_token_provider(signer.clone()),
        );

        let snapshots: Arc<dyn SnapshotSource> = Arc::new(api.clone());
        let (books, book_task) = spawn_book_stream(snapshots, public_rx, shutdown.child_token());

        let mut user_config = UserStreamConfig::new(config.account_index);
        if config.derivative {
            user_config = user_config.with_positions();
        }
        let account: Arc<dyn AccountSource> = Arc::new(api.clone());
        let (user, user_task) =
            spawn_user_stream(user_config, account, private_rx, shutdown.child_token());

        let tracker_config = TrackerConfig {
            ack_timeout: config.order_ack_timeout(),
            ..TrackerConfig::default()
        };
        let query = Arc::new(RestOrderQuery::new(api.clone(), config.account_index));
        let (tracker, tracker_task) =
            spawn_order_tracker(tracker_config, query, user.subscribe()?, shutdown.child_token());

        Ok(Self {
            config,
            api,
            signer,
            markets: RwLock::new(HashMap::new()),
            books,
            user,
            tracker,
            public_ws,
            private_ws,
            shutdown,
            tasks: Mutex::new(vec![book_task, user_task, tracker_task]),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load market rules and synchronize the nonce with the exchange.
    ///
    /// No transaction can be signed before this succeeds.
    pub async fn initialize(&self) -> ConnectorResult<()> {
        let markets = self.api.markets().await?;
        {
            let mut known = self.markets.write();
            for spec in markets {
                known.insert(spec.market_id, spec);
            }
        }
        let next = self.signer.resync_nonce(&self.api).await?;
        info!(
            markets = self.markets.read().len(),
            next_nonce = next,
            network = %self.config.network,
            "Connector initialized"
        );
        Ok(())
    }

    /// Initialize, subscribe the configured channels and run both streams.
    pub async fn start(&self) -> ConnectorResult<()> {
        self.initialize().await?;

        for sub in self.private_subscriptions() {
            self.private_ws.subscribe(sub).await?;
        }
        for market in self.config.market_ids() {
            self.track_book(market).await?;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_token_refresher(
            Arc::clone(&self.signer),
            self.shutdown.child_token(),
        ));
        tasks.push(spawn_stream(Arc::clone(&self.public_ws)));
        tasks.push(spawn_stream(Arc::clone(&self.private_ws)));
        info!("Connector started");
        Ok(())
    }

    /// Stop every stream and actor and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Connector shutdown requested");
        self.public_ws.shutdown();
        self.private_ws.shutdown();
        self.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Connector task ended abnormally");
            }
        }
        info!("Connector stopped");
    }

    fn private_subscriptions(&self) -> Vec<Subscription> {
        let account = self.config.account_index;
        let mut subs = vec![Subscription::orders(account), Subscription::fills(account)];
        if self.config.derivative {
            subs.push(Subscription::positions(account));
            subs.push(Subscription::funding(account));
        }
        subs
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Sign, track and send an order. Returns once the send resolved.
    ///
    /// A timed-out send still returns the id: the order stays
    /// PENDING_CREATE until a status query settles it.
    pub async fn submit_order(&self, intent: OrderIntent) -> ConnectorResult<ClientOrderId> {
        let spec = self.market(intent.market)?;
        let id = intent.client_order_id.clone();
        let params = TxParams::for_order(&intent, &spec)?;
        let (permit, tx) = self.prepare(params).await?;

        if let Err(e) = self.tracker.register(intent).await {
            self.signer
                .nonces()
                .release(self.signer.api_key_index(), tx.nonce);
            return Err(e.into());
        }

        let outcome = match self.api.send_tx_reserved(permit, &tx).await {
            Ok(receipt) => {
                info!(
                    client_order_id = %id,
                    market_id = %spec.market_id,
                    nonce = tx.nonce,
                    order_index = ?receipt.order_index,
                    "Order accepted"
                );
                SubmitOutcome::Accepted {
                    exchange_order_id: receipt.order_index,
                }
            }
            Err(e) => match self.classify(&e, tx.nonce).await {
                TxFailure::Ambiguous => {
                    warn!(client_order_id = %id, error = %e, "Order outcome unknown, reconciling");
                    SubmitOutcome::Unknown
                }
                TxFailure::NotSent | TxFailure::NonceMismatch | TxFailure::Rejected(_) => {
                    SubmitOutcome::Rejected {
                        reason: e.to_string(),
                    }
                }
            },
        };

        self.tracker.submit_outcome(id.clone(), outcome.clone()).await?;
        match outcome {
            SubmitOutcome::Rejected { reason } => Err(ConnectorError::Rejected {
                client_order_id: id,
                reason,
            }),
            SubmitOutcome::Accepted { .. } | SubmitOutcome::Unknown => Ok(id),
        }
    }

    /// IOC order bounded by the slippage limit around the book mid.
    pub async fn market_order(
        &self,
        market: MarketId,
        side: OrderSide,
        amount: Size,
    ) -> ConnectorResult<ClientOrderId> {
        let mid = self
            .books
            .mid_price(market)
            .ok_or(ConnectorError::NoMidPrice(market))?;
        let worst = slippage_bound(mid, side);
        debug!(market_id = %market, %mid, %worst, "Market order priced");
        self.submit_order(OrderIntent::market(market, side, worst, amount))
            .await
    }

    /// Cancel one order. Completion is reported on the order event stream.
    pub async fn cancel_order(&self, id: &ClientOrderId) -> ConnectorResult<()> {
        let order = self.tracker.begin_cancel(id.clone()).await?;
        let Some(order_index) = order.exchange_order_id else {
            self.tracker
                .cancel_outcome(id.clone(), CancelOutcome::NotSent)
                .await?;
            return Err(ConnectorError::NotAcknowledged(id.clone()));
        };

        let (permit, tx) = match self.prepare(TxParams::cancel(order.market, order_index)).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.tracker
                    .cancel_outcome(id.clone(), CancelOutcome::NotSent)
                    .await?;
                return Err(e);
            }
        };

        let (outcome, result) = match self.api.send_tx_reserved(permit, &tx).await {
            Ok(_) => {
                info!(client_order_id = %id, order_index, nonce = tx.nonce, "Cancel accepted");
                (CancelOutcome::Accepted, Ok(()))
            }
            Err(e) if e.is_order_not_found() => (
                CancelOutcome::Rejected {
                    reason: e.to_string(),
                    not_found: true,
                },
                Ok(()),
            ),
            Err(e) => match self.classify(&e, tx.nonce).await {
                TxFailure::Ambiguous => (CancelOutcome::Unknown, Ok(())),
                TxFailure::NotSent | TxFailure::NonceMismatch => {
                    (CancelOutcome::NotSent, Err(e.into()))
                }
                TxFailure::Rejected(reason) => (
                    CancelOutcome::Rejected {
                        reason: reason.clone(),
                        not_found: false,
                    },
                    Err(ConnectorError::Rejected {
                        client_order_id: id.clone(),
                        reason,
                    }),
                ),
            },
        };
        self.tracker.cancel_outcome(id.clone(), outcome).await?;
        result
    }

    /// Cancel every open order with one cancel-all transaction. Returns
    /// the number of tracked orders moved to PENDING_CANCEL.
    pub async fn cancel_all(&self) -> ConnectorResult<usize> {
        let mut pending = Vec::new();
        for order in self.tracker.open_orders() {
            if !order.state.is_cancelable() {
                continue;
            }
            match self.tracker.begin_cancel(order.client_order_id.clone()).await {
                Ok(_) => pending.push(order.client_order_id),
                Err(e) => debug!(client_order_id = %order.client_order_id, error = %e, "Skipped in cancel-all"),
            }
        }

        let (outcome, result) = match self.prepare(TxParams::cancel_all(now_millis())).await {
            Ok((permit, tx)) => {
                match self
                    .api
                    .send_tx_batch_reserved(permit, std::slice::from_ref(&tx))
                    .await
                {
                    Ok(_) => (CancelOutcome::Accepted, Ok(pending.len())),
                    Err(e) => match self.classify(&e, tx.nonce).await {
                        TxFailure::Ambiguous => (CancelOutcome::Unknown, Ok(pending.len())),
                        TxFailure::NotSent | TxFailure::NonceMismatch | TxFailure::Rejected(_) => {
                            (CancelOutcome::NotSent, Err(e.into()))
                        }
                    },
                }
            }
            Err(e) => (CancelOutcome::NotSent, Err(e)),
        };
        info!(orders = pending.len(), outcome = ?outcome, "Cancel-all sent");
        for id in pending {
            self.tracker.cancel_outcome(id, outcome.clone()).await?;
        }
        result
    }

    /// Current state of a tracked order.
    pub fn query_order(&self, id: &ClientOrderId) -> Option<ClientOrder> {
        self.tracker.order(id)
    }

    pub fn open_orders(&self) -> Vec<ClientOrder> {
        self.tracker.open_orders()
    }

    /// Order state transitions, fills and reconciliation notices.
    pub async fn subscribe_orders(&self) -> ConnectorResult<mpsc::UnboundedReceiver<OrderEvent>> {
        Ok(self.tracker.subscribe().await?)
    }

    // ========================================================================
    // Market data and account
    // ========================================================================

    /// Stream `market`'s book and public trades. The receiver carries
    /// events of every tracked market.
    pub async fn subscribe_book(
        &self,
        market: MarketId,
    ) -> ConnectorResult<mpsc::UnboundedReceiver<BookEvent>> {
        self.track_book(market).await?;
        Ok(self.books.subscribe()?)
    }

    pub async fn unsubscribe_book(&self, market: MarketId) -> ConnectorResult<()> {
        self.public_ws
            .unsubscribe(Subscription::order_book(market))
            .await?;
        self.public_ws.unsubscribe(Subscription::trades(market)).await?;
        self.books.untrack(market)?;
        Ok(())
    }

    async fn track_book(&self, market: MarketId) -> ConnectorResult<()> {
        self.market(market)?;
        // Tracked first so diffs arriving right after subscribing are buffered
        self.books.track(market)?;
        for sub in [Subscription::order_book(market), Subscription::trades(market)] {
            if let Err(e) = self.public_ws.subscribe(sub).await {
                warn!(market_id = %market, error = %e, "Book subscription refused");
                self.books.untrack(market)?;
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn book(&self, market: MarketId) -> Option<OrderBookState> {
        self.books.book(market)
    }

    /// Typed private events: order updates, fills, positions, funding.
    pub fn subscribe_user_events(&self) -> ConnectorResult<mpsc::UnboundedReceiver<UserEvent>> {
        Ok(self.user.subscribe()?)
    }

    pub async fn account_balances(&self) -> ConnectorResult<Vec<Balance>> {
        Ok(self.api.account(self.config.account_index).await?.balances)
    }

    pub fn market(&self, market: MarketId) -> ConnectorResult<MarketSpec> {
        self.markets
            .read()
            .get(&market)
            .cloned()
            .ok_or(ConnectorError::UnknownMarket(market))
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub(crate) fn user_stream(&self) -> &UserStreamHandle {
        &self.user
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Reserve budget, then sign. Resyncs the nonce first if a mismatch
    /// left the sequence invalidated.
    async fn prepare(&self, params: TxParams) -> ConnectorResult<(BudgetPermit, SignedTransaction)> {
        if !self.signer.nonces().is_synced(self.signer.api_key_index()) {
            self.signer.resync_nonce(&self.api).await?;
        }
        let permit = self.api.reserve_tx()?;
        let tx = self.signer.sign(params)?;
        Ok((permit, tx))
    }

    /// Settle a failed send of the transaction signed with `nonce`.
    async fn classify(&self, err: &RestError, nonce: u64) -> TxFailure {
        if err.is_not_sent() {
            let key = self.signer.api_key_index();
            if !self.signer.nonces().release(key, nonce) {
                warn!(nonce, "Unsent transaction nonce skipped, a later one was already allocated");
            }
            return TxFailure::NotSent;
        }
        if err.is_ambiguous() {
            return TxFailure::Ambiguous;
        }
        if err.is_nonce_mismatch() {
            self.signer.on_nonce_mismatch();
            if let Err(e) = self.signer.resync_nonce(&self.api).await {
                error!(error = %e, "Nonce resync failed, retried on next transaction");
            }
            return TxFailure::NonceMismatch;
        }
        TxFailure::Rejected(err.to_string())
    }
}

fn spawn_stream(ws: Arc<ConnectionManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = ws.run().await {
            error!(error = %e, "WebSocket stream stopped");
        }
    })
}
