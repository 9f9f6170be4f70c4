//! User stream actor.
//!
//! Live events are held back while a REST reconciliation is in flight, so
//! consumers see the reconciled state first and then everything that
//! arrived after the reconnect, in arrival order. If too many pile up
//! while REST keeps failing, they are dropped and a fresh reconciliation
//! starts; the snapshot's recent fills cover what was dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lighter_core::{Fill, FundingPayment, MarketId, OrderUpdate, Position};
use lighter_telemetry::Metrics;
use lighter_ws::StreamEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dedup::EventDeduplicator;
use crate::error::{AccountError, AccountResult};
use crate::parser::parse_user_message;
use crate::source::{AccountSnapshot, AccountSource};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Live events buffered during one reconciliation.
pub const DEFAULT_MAX_HELD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Order(OrderUpdate),
    Fill(Fill),
    Position(Position),
    Funding(FundingPayment),
    /// Open orders according to REST after a (re)connect. Orders missing
    /// from this list are no longer resting.
    Reconciled {
        open_orders: Vec<OrderUpdate>,
        reconnect: bool,
    },
    /// The private stream dropped; events may be missing until the next
    /// `Reconciled`.
    Interrupted { reason: String },
}

#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    pub account_index: u64,
    /// Also reconcile positions (derivative accounts).
    pub include_positions: bool,
    pub retry_delay: Duration,
    pub max_held: usize,
}

impl UserStreamConfig {
    pub fn new(account_index: u64) -> Self {
        Self {
            account_index,
            include_positions: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_held: DEFAULT_MAX_HELD,
        }
    }

    pub fn with_positions(mut self) -> Self {
        self.include_positions = true;
        self
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug)]
enum UserStreamMsg {
    Subscribe(mpsc::UnboundedSender<UserEvent>),
    Fetch {
        generation: u64,
        reconnect: bool,
    },
    SnapshotResult {
        generation: u64,
        reconnect: bool,
        result: AccountResult<AccountSnapshot>,
    },
}

struct UserStreamTask {
    config: UserStreamConfig,
    source: Arc<dyn AccountSource>,
    events: mpsc::Receiver<StreamEvent>,
    cmd_rx: mpsc::UnboundedReceiver<UserStreamMsg>,
    cmd_tx: mpsc::UnboundedSender<UserStreamMsg>,
    dedup: EventDeduplicator,
    subscribers: Vec<mpsc::UnboundedSender<UserEvent>>,
    /// Live events received during reconciliation.
    held: Vec<UserEvent>,
    generation: u64,
    reconciling: Arc<AtomicBool>,
    positions: Arc<DashMap<MarketId, Position>>,
    funding: Arc<DashMap<MarketId, FundingPayment>>,
    shutdown: CancellationToken,
}

impl UserStreamTask {
    async fn run(mut self) {
        debug!(account_index = self.config.account_index, "User stream started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(msg) = self.cmd_rx.recv() => self.handle_command(msg),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_stream_event(event),
                    None => {
                        info!("Connection event channel closed, user stream stopping");
                        break;
                    }
                },
            }
        }
        debug!("User stream stopped");
    }

    fn handle_command(&mut self, msg: UserStreamMsg) {
        match msg {
            UserStreamMsg::Subscribe(tx) => self.subscribers.push(tx),
            UserStreamMsg::Fetch {
                generation,
                reconnect,
            } => {
                if generation == self.generation {
                    self.spawn_fetch(generation, reconnect);
                }
            }
            UserStreamMsg::SnapshotResult {
                generation,
                reconnect,
                result,
            } => {
                if generation != self.generation {
                    trace!(generation, "Dropping superseded account snapshot");
                    return;
                }
                match result {
                    Ok(snapshot) => self.finish_reconcile(snapshot, reconnect),
                    Err(e) => {
                        warn!(
                            error = %e,
                            delay_ms = self.config.retry_delay.as_millis() as u64,
                            "Account reconciliation failed, retrying"
                        );
                        self.schedule_fetch(generation, reconnect);
                    }
                }
            }
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { reconnect } => {
                info!(
                    account_index = self.config.account_index,
                    reconnect, "User stream connected, reconciling account state"
                );
                self.reconciling.store(true, Ordering::SeqCst);
                self.generation += 1;
                self.spawn_fetch(self.generation, reconnect);
            }
            StreamEvent::Disconnected { reason } => {
                self.reconciling.store(true, Ordering::SeqCst);
                self.publish(UserEvent::Interrupted { reason });
            }
            StreamEvent::Message(msg) => match parse_user_message(&msg) {
                Ok(events) => {
                    for event in events {
                        if self.reconciling.load(Ordering::SeqCst) {
                            self.hold(event);
                        } else {
                            self.emit(event);
                        }
                    }
                }
                Err(e) => warn!(channel = %msg.channel, error = %e, "Dropping unparseable user frame"),
            },
        }
    }

    fn hold(&mut self, event: UserEvent) {
        self.held.push(event);
        if self.held.len() <= self.config.max_held {
            return;
        }
        warn!(
            dropped = self.held.len(),
            max_held = self.config.max_held,
            "Held user events overflowed, restarting reconciliation"
        );
        self.held.clear();
        // Supersedes the pending fetch or retry
        self.generation += 1;
        self.spawn_fetch(self.generation, true);
    }

    fn finish_reconcile(&mut self, snapshot: AccountSnapshot, reconnect: bool) {
        let AccountSnapshot {
            open_orders,
            mut recent_fills,
            positions,
        } = snapshot;

        recent_fills.sort_by_key(|f| f.trade_id);
        let fill_count = recent_fills.len();
        for fill in recent_fills {
            self.emit(UserEvent::Fill(fill));
        }

        if self.config.include_positions {
            self.positions.clear();
            for position in positions {
                self.emit(UserEvent::Position(position));
            }
        }

        info!(
            open_orders = open_orders.len(),
            recent_fills = fill_count,
            held = self.held.len(),
            "Account reconciled"
        );
        if reconnect {
            Metrics::order_reconciled("reconnect");
        }
        self.publish(UserEvent::Reconciled {
            open_orders,
            reconnect,
        });

        for event in std::mem::take(&mut self.held) {
            self.emit(event);
        }
        self.reconciling.store(false, Ordering::SeqCst);
    }

    /// Deduplicate, update caches and publish.
    fn emit(&mut self, event: UserEvent) {
        let fresh = match &event {
            UserEvent::Order(update) => self.dedup.accept_order(update),
            UserEvent::Fill(fill) => self.dedup.accept_fill(fill),
            UserEvent::Position(position) => {
                if position.is_flat() {
                    self.positions.remove(&position.market);
                } else {
                    self.positions.insert(position.market, position.clone());
                }
                true
            }
            UserEvent::Funding(payment) => {
                self.funding.insert(payment.market, payment.clone());
                true
            }
            UserEvent::Reconciled { .. } | UserEvent::Interrupted { .. } => true,
        };
        if fresh {
            self.publish(event);
        } else {
            trace!(?event, "Duplicate user event dropped");
        }
    }

    fn spawn_fetch(&self, generation: u64, reconnect: bool) {
        let source = Arc::clone(&self.source);
        let tx = self.cmd_tx.clone();
        let account_index = self.config.account_index;
        let include_positions = self.config.include_positions;
        tokio::spawn(async move {
            let result = source.snapshot(account_index, include_positions).await;
            let _ = tx.send(UserStreamMsg::SnapshotResult {
                generation,
                reconnect,
                result,
            });
        });
    }

    fn schedule_fetch(&self, generation: u64, reconnect: bool) {
        let tx = self.cmd_tx.clone();
        let delay = self.config.retry_delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(UserStreamMsg::Fetch { generation, reconnect });
                }
            }
        });
    }

    fn publish(&mut self, event: UserEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct UserStreamHandle {
    tx: mpsc::UnboundedSender<UserStreamMsg>,
    reconciling: Arc<AtomicBool>,
    positions: Arc<DashMap<MarketId, Position>>,
    funding: Arc<DashMap<MarketId, FundingPayment>>,
}

impl UserStreamHandle {
    /// New event sequence from this point on.
    pub fn subscribe(&self) -> AccountResult<mpsc::UnboundedReceiver<UserEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx
            .send(UserStreamMsg::Subscribe(tx))
            .map_err(|_| AccountError::StreamClosed)?;
        Ok(rx)
    }

    /// True until the first reconciliation after a (re)connect completes.
    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::SeqCst)
    }

    /// Open positions, ordered by market.
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<_> = self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by_key(|p| p.market);
        positions
    }

    pub fn position(&self, market: MarketId) -> Option<Position> {
        self.positions.get(&market).map(|p| p.clone())
    }

    pub fn last_funding_payment(&self, market: MarketId) -> Option<FundingPayment> {
        self.funding.get(&market).map(|f| f.clone())
    }
}

/// Spawn the user stream actor over the private `ConnectionManager` events.
pub fn spawn_user_stream(
    config: UserStreamConfig,
    source: Arc<dyn AccountSource>,
    events: mpsc::Receiver<StreamEvent>,
    shutdown: CancellationToken,
) -> (UserStreamHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let reconciling = Arc::new(AtomicBool::new(true));
    let positions = Arc::new(DashMap::new());
    let funding = Arc::new(DashMap::new());

    let task = UserStreamTask {
        config,
        source,
        events,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        dedup: EventDeduplicator::default(),
        subscribers: Vec::new(),
        held: Vec::new(),
        generation: 0,
        reconciling: Arc::clone(&reconciling),
        positions: Arc::clone(&positions),
        funding: Arc::clone(&funding),
        shutdown,
    };
    let join = tokio::spawn(task.run());

    (
        UserStreamHandle {
            tx: cmd_tx,
            reconciling,
            positions,
            funding,
        },
        join,
    )
}
