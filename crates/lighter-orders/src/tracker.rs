//! Order tracker actor.
//!
//! A single task owns the [`OrderStore`]; everything else talks to it
//! through [`OrderTrackerHandle`]. The handle keeps a DashMap copy of every
//! order, written only by the task after each change, so `order()` is a
//! synchronous read that never observes a half-applied update.
//!
//! Inputs:
//! - submit/cancel outcomes reported by the connector
//! - the user stream (status updates, fills, post-reconnect open orders)
//! - status-query results for orders whose outcome is unknown
//!
//! Output: an [`OrderEvent`] sequence per subscriber.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lighter_account::UserEvent;
use lighter_core::{now_millis, ClientOrder, ClientOrderId, Fill, OrderIntent, OrderState, OrderUpdate};
use lighter_telemetry::Metrics;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::query::OrderQuery;
use crate::store::{OrderStore, Transition, DEFAULT_TERMINAL_CAPACITY};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long PENDING_CREATE / PENDING_CANCEL may go unacknowledged
    /// before the order status is queried.
    pub ack_timeout: Duration,
    pub check_interval: Duration,
    pub terminal_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            terminal_capacity: DEFAULT_TERMINAL_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Result of sending a create-order transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { exchange_order_id: Option<u64> },
    Rejected { reason: String },
    /// Timed out or failed after reaching the network.
    Unknown,
}

/// Result of sending a cancel transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Accepted; the order stays PENDING_CANCEL until the stream confirms.
    Accepted,
    Rejected { reason: String, not_found: bool },
    /// Signing or budget failed before anything was sent.
    NotSent,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Transition { order: ClientOrder, from: OrderState },
    Fill {
        client_order_id: ClientOrderId,
        fill: Fill,
    },
    /// Outcome unknown; a status query is in flight.
    Reconciling { order: ClientOrder },
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
enum TrackerMsg {
    Register {
        intent: OrderIntent,
        reply: oneshot::Sender<TrackerResult<ClientOrder>>,
    },
    Submitted {
        id: ClientOrderId,
        outcome: SubmitOutcome,
    },
    BeginCancel {
        id: ClientOrderId,
        reply: oneshot::Sender<TrackerResult<ClientOrder>>,
    },
    CancelSent {
        id: ClientOrderId,
        outcome: CancelOutcome,
    },
    QueryResult {
        id: ClientOrderId,
        result: TrackerResult<Option<OrderUpdate>>,
    },
    Subscribe(mpsc::UnboundedSender<OrderEvent>),
}

// ============================================================================
// Task
// ============================================================================

struct OrderTrackerTask {
    config: TrackerConfig,
    store: OrderStore,
    query: Arc<dyn OrderQuery>,
    rx: mpsc::Receiver<TrackerMsg>,
    tx: mpsc::Sender<TrackerMsg>,
    user_events: mpsc::UnboundedReceiver<UserEvent>,
    in_flight: HashSet<ClientOrderId>,
    subscribers: Vec<mpsc::UnboundedSender<OrderEvent>>,
    cache: Arc<DashMap<ClientOrderId, ClientOrder>>,
    /// Wall clock at spawn, advanced by tokio's clock.
    epoch_ms: u64,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl OrderTrackerTask {
    async fn run(mut self) {
        debug!("Order tracker started");
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut user_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(msg) = self.rx.recv() => self.handle_msg(msg),
                event = self.user_events.recv(), if user_open => match event {
                    Some(event) => self.handle_user_event(event),
                    None => {
                        warn!("User event stream ended");
                        user_open = false;
                    }
                },
                _ = ticker.tick() => self.dispatch_queries(),
            }
        }
        debug!("Order tracker stopped");
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.epoch.elapsed().as_millis() as u64
    }

    fn handle_msg(&mut self, msg: TrackerMsg) {
        let now = self.now_ms();
        match msg {
            TrackerMsg::Register { intent, reply } => {
                let result = self.store.register(&intent, now);
                if let Ok(order) = &result {
                    info!(
                        client_order_id = %order.client_order_id,
                        market_id = %order.market,
                        side = %order.side,
                        price = %order.price,
                        amount = %order.amount,
                        "Order registered"
                    );
                    self.cache.insert(order.client_order_id.clone(), order.clone());
                }
                let _ = reply.send(result);
            }
            TrackerMsg::Submitted { id, outcome } => {
                let result = match outcome {
                    SubmitOutcome::Accepted { exchange_order_id } => {
                        self.store.submit_accepted(&id, exchange_order_id, now)
                    }
                    SubmitOutcome::Rejected { reason } => {
                        self.store.submit_rejected(&id, &reason, now)
                    }
                    SubmitOutcome::Unknown => self.store.submit_unknown(&id).map(|()| {
                        self.publish_reconciling(&id);
                        Vec::new()
                    }),
                };
                self.finish(&id, result);
            }
            TrackerMsg::BeginCancel { id, reply } => {
                let result = self.store.begin_cancel(&id, now).map(|(order, transitions)| {
                    self.publish_transitions(&transitions);
                    order
                });
                let _ = reply.send(result);
            }
            TrackerMsg::CancelSent { id, outcome } => {
                let result = match outcome {
                    CancelOutcome::Accepted => {
                        debug!(client_order_id = %id, "Cancel accepted");
                        Ok(Vec::new())
                    }
                    CancelOutcome::Rejected { reason, not_found } => {
                        let result = self.store.cancel_rejected(&id, &reason, not_found, now);
                        if not_found {
                            Metrics::order_reconciled("cancel_not_found");
                            self.dispatch_queries();
                        }
                        result
                    }
                    CancelOutcome::NotSent => self.store.cancel_not_sent(&id, now),
                    CancelOutcome::Unknown => self.store.cancel_unknown(&id).map(|()| {
                        self.publish_reconciling(&id);
                        Vec::new()
                    }),
                };
                self.finish(&id, result);
            }
            TrackerMsg::QueryResult { id, result } => {
                self.in_flight.remove(&id);
                match result {
                    Ok(found) => {
                        debug!(client_order_id = %id, found = found.is_some(), "Order status query answered");
                        let transitions = self.store.apply_query_result(&id, found.as_ref(), now);
                        self.publish_transitions(&transitions);
                        self.flush();
                    }
                    Err(e) => {
                        warn!(client_order_id = %id, error = %e, "Order status query failed, will retry");
                        self.store.request_query(&id);
                    }
                }
            }
            TrackerMsg::Subscribe(tx) => self.subscribers.push(tx),
        }
    }

    fn handle_user_event(&mut self, event: UserEvent) {
        let now = self.now_ms();
        match event {
            UserEvent::Order(update) => {
                let transitions = self.store.apply_update(&update, now);
                self.publish_transitions(&transitions);
            }
            UserEvent::Fill(fill) => {
                let transitions = self
                    .store
                    .apply_fill(&fill, now)
                    .map(|(_, t)| t)
                    .unwrap_or_default();
                // Fill events go out before the transition they cause
                self.flush();
                self.publish_transitions(&transitions);
            }
            UserEvent::Reconciled {
                open_orders,
                reconnect,
            } => {
                let transitions = self.store.reconcile_open_orders(&open_orders, now);
                self.publish_transitions(&transitions);
                if reconnect {
                    info!(open_orders = open_orders.len(), "Reconciling orders after reconnect");
                }
                self.dispatch_queries();
            }
            UserEvent::Interrupted { reason } => {
                debug!(%reason, "User stream interrupted");
            }
            UserEvent::Position(_) | UserEvent::Funding(_) => {}
        }
        self.flush();
    }

    fn finish(&mut self, id: &ClientOrderId, result: TrackerResult<Vec<Transition>>) {
        match result {
            Ok(transitions) => self.publish_transitions(&transitions),
            Err(e) => warn!(client_order_id = %id, error = %e, "Order outcome not applied"),
        }
        self.refresh(id);
        self.flush();
    }

    /// Start status queries for every order that needs one.
    fn dispatch_queries(&mut self) {
        let now = self.now_ms();
        let timeout_ms = self.config.ack_timeout.as_millis() as u64;
        for order in self.store.due_queries(now, timeout_ms) {
            let id = order.client_order_id.clone();
            if !self.in_flight.insert(id.clone()) {
                continue;
            }
            let trigger = match order.state {
                OrderState::PendingCreate => "ack_timeout",
                OrderState::PendingCancel => "cancel_timeout",
                _ => "missing_open_order",
            };
            Metrics::order_reconciled(trigger);
            info!(client_order_id = %id, state = %order.state, trigger, "Querying order status");
            self.publish_reconciling(&id);

            let query = Arc::clone(&self.query);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let result = query.order_status(order).await;
                let _ = tx.send(TrackerMsg::QueryResult { id, result }).await;
            });
        }
    }

    fn publish_transitions(&mut self, transitions: &[Transition]) {
        for t in transitions {
            self.refresh(&t.client_order_id);
            if t.to.is_terminal() {
                Metrics::order_terminal(&t.to.to_string());
                info!(client_order_id = %t.client_order_id, from = %t.from, state = %t.to, "Order finished");
            }
            if let Some(order) = self.store.get(&t.client_order_id).cloned() {
                self.publish(OrderEvent::Transition {
                    order,
                    from: t.from,
                });
            }
        }
    }

    fn publish_reconciling(&mut self, id: &ClientOrderId) {
        self.refresh(id);
        if let Some(order) = self.store.get(id).cloned() {
            self.publish(OrderEvent::Reconciling { order });
        }
    }

    /// Publish applied fills and drop evicted orders from the cache.
    fn flush(&mut self) {
        for (client_order_id, fill) in self.store.drain_fills() {
            self.refresh(&client_order_id);
            self.publish(OrderEvent::Fill {
                client_order_id,
                fill,
            });
        }
        for id in self.store.drain_evicted() {
            trace!(client_order_id = %id, "Terminal order evicted");
            self.cache.remove(&id);
        }
    }

    fn refresh(&self, id: &ClientOrderId) {
        match self.store.get(id) {
            Some(order) => {
                self.cache.insert(id.clone(), order.clone());
            }
            None => {
                self.cache.remove(id);
            }
        }
    }

    fn publish(&mut self, event: OrderEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct OrderTrackerHandle {
    tx: mpsc::Sender<TrackerMsg>,
    cache: Arc<DashMap<ClientOrderId, ClientOrder>>,
}

impl OrderTrackerHandle {
    /// Start tracking a signed intent in PENDING_CREATE.
    pub async fn register(&self, intent: OrderIntent) -> TrackerResult<ClientOrder> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMsg::Register { intent, reply }).await?;
        rx.await.map_err(|_| TrackerError::TrackerClosed)?
    }

    pub async fn submit_outcome(&self, id: ClientOrderId, outcome: SubmitOutcome) -> TrackerResult<()> {
        self.send(TrackerMsg::Submitted { id, outcome }).await
    }

    /// Move the order to PENDING_CANCEL, or fail if it is not cancelable.
    pub async fn begin_cancel(&self, id: ClientOrderId) -> TrackerResult<ClientOrder> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMsg::BeginCancel { id, reply }).await?;
        rx.await.map_err(|_| TrackerError::TrackerClosed)?
    }

    pub async fn cancel_outcome(&self, id: ClientOrderId, outcome: CancelOutcome) -> TrackerResult<()> {
        self.send(TrackerMsg::CancelSent { id, outcome }).await
    }

    pub async fn subscribe(&self) -> TrackerResult<mpsc::UnboundedReceiver<OrderEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(TrackerMsg::Subscribe(tx)).await?;
        Ok(rx)
    }

    /// Current state of a tracked order.
    pub fn order(&self, id: &ClientOrderId) -> Option<ClientOrder> {
        self.cache.get(id).map(|o| o.clone())
    }

    /// Non-terminal orders.
    pub fn open_orders(&self) -> Vec<ClientOrder> {
        self.cache
            .iter()
            .filter(|o| !o.state.is_terminal())
            .map(|o| o.value().clone())
            .collect()
    }

    async fn send(&self, msg: TrackerMsg) -> TrackerResult<()> {
        self.tx.send(msg).await.map_err(|_| TrackerError::TrackerClosed)
    }
}

/// Spawn the tracker over the user stream's event sequence.
pub fn spawn_order_tracker(
    config: TrackerConfig,
    query: Arc<dyn OrderQuery>,
    user_events: mpsc::UnboundedReceiver<UserEvent>,
    shutdown: CancellationToken,
) -> (OrderTrackerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let cache = Arc::new(DashMap::new());

    let task = OrderTrackerTask {
        store: OrderStore::new(config.terminal_capacity),
        config,
        query,
        rx,
        tx: tx.clone(),
        user_events,
        in_flight: HashSet::new(),
        subscribers: Vec::new(),
        cache: Arc::clone(&cache),
        epoch_ms: now_millis(),
        epoch: Instant::now(),
        shutdown,
    };
    let join = tokio::spawn(task.run());

    (OrderTrackerHandle { tx, cache }, join)
}
