//! Order book stream actor.
//!
//! One task owns every `BookSynchronizer`. It consumes connection events
//! from the public `ConnectionManager`, fetches snapshots on its own
//! spawned tasks, and publishes [`BookEvent`]s to any number of
//! subscribers. Readers of [`BookStreamHandle::book`] see the cache, which
//! is only written after a diff has been fully applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lighter_core::{BookLevel, BookSnapshot, MarketId, Price};
use lighter_telemetry::Metrics;
use lighter_ws::StreamEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::book::{BookDiff, OrderBookState};
use crate::error::{FeedError, FeedResult};
use crate::parser::{parse_feed_message, FeedMessage, PublicTrade};
use crate::source::SnapshotSource;
use crate::sync::{BookSynchronizer, DiffOutcome};

/// Delay before retrying a failed snapshot fetch.
pub const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
    /// Full book, after a (re)sync or on subscribe.
    Snapshot(BookSnapshot),
    /// One applied diff. Levels carry absolute sizes; zero means removed.
    Delta {
        market: MarketId,
        update_id: u64,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: u64,
    },
    Trade(PublicTrade),
    /// The book is being resynced; discard local copies until the next
    /// `Snapshot`.
    Invalidated { market: MarketId },
}

impl BookEvent {
    fn delta(diff: &BookDiff) -> Self {
        Self::Delta {
            market: diff.market,
            update_id: diff.last_update_id,
            bids: diff.bids.clone(),
            asks: diff.asks.clone(),
            timestamp: diff.timestamp,
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug)]
enum BookStreamMsg {
    Track(MarketId),
    Untrack(MarketId),
    Subscribe(mpsc::UnboundedSender<BookEvent>),
    Fetch {
        market: MarketId,
        generation: u64,
    },
    SnapshotResult {
        market: MarketId,
        generation: u64,
        result: FeedResult<BookSnapshot>,
    },
}

struct MarketSlot {
    sync: BookSynchronizer,
    /// Bumped on every snapshot request; older results are dropped.
    generation: u64,
}

struct BookStreamTask {
    source: Arc<dyn SnapshotSource>,
    events: mpsc::Receiver<StreamEvent>,
    cmd_rx: mpsc::UnboundedReceiver<BookStreamMsg>,
    cmd_tx: mpsc::UnboundedSender<BookStreamMsg>,
    markets: HashMap<MarketId, MarketSlot>,
    subscribers: Vec<mpsc::UnboundedSender<BookEvent>>,
    books: Arc<DashMap<MarketId, OrderBookState>>,
    shutdown: CancellationToken,
}

impl BookStreamTask {
    async fn run(mut self) {
        debug!("Book stream started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(msg) = self.cmd_rx.recv() => self.handle_command(msg),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_stream_event(event),
                    None => {
                        info!("Connection event channel closed, book stream stopping");
                        break;
                    }
                },
            }
        }
        debug!("Book stream stopped");
    }

    fn handle_command(&mut self, msg: BookStreamMsg) {
        match msg {
            BookStreamMsg::Track(market) => {
                if self.markets.contains_key(&market) {
                    return;
                }
                info!(market_id = %market, "Tracking order book");
                self.markets.insert(
                    market,
                    MarketSlot {
                        sync: BookSynchronizer::new(market),
                        generation: 0,
                    },
                );
                self.request_snapshot(market, None);
            }
            BookStreamMsg::Untrack(market) => {
                if self.markets.remove(&market).is_some() {
                    info!(market_id = %market, "Stopped tracking order book");
                    self.books.remove(&market);
                    self.publish(BookEvent::Invalidated { market });
                }
            }
            BookStreamMsg::Subscribe(tx) => {
                for entry in self.books.iter() {
                    let _ = tx.send(BookEvent::Snapshot(entry.value().to_snapshot()));
                }
                self.subscribers.push(tx);
            }
            BookStreamMsg::Fetch { market, generation } => {
                if self.is_current(market, generation) {
                    self.spawn_fetch(market, generation);
                }
            }
            BookStreamMsg::SnapshotResult {
                market,
                generation,
                result,
            } => self.handle_snapshot(market, generation, result),
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { reconnect } => {
                if reconnect {
                    info!(markets = self.markets.len(), "Public stream reconnected, resyncing books");
                }
                let markets: Vec<_> = self.markets.keys().copied().collect();
                for market in markets {
                    self.invalidate(market);
                    self.request_snapshot(market, None);
                }
            }
            StreamEvent::Disconnected { reason } => {
                debug!(%reason, "Public stream down, invalidating books");
                let markets: Vec<_> = self.markets.keys().copied().collect();
                for market in markets {
                    self.invalidate(market);
                }
            }
            StreamEvent::Message(msg) => match parse_feed_message(&msg) {
                Ok(Some(FeedMessage::Diff(diff))) => self.handle_diff(diff),
                Ok(Some(FeedMessage::Trades(trades))) => {
                    for trade in trades {
                        self.publish(BookEvent::Trade(trade));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(channel = %msg.channel, error = %e, "Dropping unparseable feed frame"),
            },
        }
    }

    fn handle_diff(&mut self, diff: BookDiff) {
        let market = diff.market;
        let Some(slot) = self.markets.get_mut(&market) else {
            trace!(market_id = %market, "Diff for untracked market");
            return;
        };
        match slot.sync.on_diff(diff.clone()) {
            Ok(DiffOutcome::Applied) => {
                if let Some(book) = slot.sync.book() {
                    self.books.insert(market, book.clone());
                }
                self.publish(BookEvent::delta(&diff));
            }
            Ok(DiffOutcome::Buffered | DiffOutcome::Stale) => {}
            Err(e) => {
                debug_assert!(e.is_desync());
                Metrics::book_resync(&market.to_string());
                self.books.remove(&market);
                self.publish(BookEvent::Invalidated { market });
                self.request_snapshot(market, None);
            }
        }
    }

    fn handle_snapshot(
        &mut self,
        market: MarketId,
        generation: u64,
        result: FeedResult<BookSnapshot>,
    ) {
        if !self.is_current(market, generation) {
            trace!(market_id = %market, generation, "Dropping superseded snapshot");
            return;
        }
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let retry_after = match &e {
                    FeedError::SnapshotUnavailable { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = retry_after.unwrap_or(SNAPSHOT_RETRY_DELAY);
                warn!(
                    market_id = %market,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Snapshot fetch failed, retrying"
                );
                self.request_snapshot(market, Some(delay));
                return;
            }
        };

        let Some(slot) = self.markets.get_mut(&market) else {
            return;
        };
        match slot.sync.on_snapshot(&snapshot) {
            Ok(replayed) => {
                if let Some(book) = slot.sync.book() {
                    info!(
                        market_id = %market,
                        last_update_id = book.last_update_id(),
                        replayed = replayed.len(),
                        "Order book synchronized"
                    );
                    let event = BookEvent::Snapshot(book.to_snapshot());
                    self.books.insert(market, book.clone());
                    self.publish(event);
                }
            }
            Err(e) => {
                warn!(market_id = %market, error = %e, "Snapshot does not chain, refetching");
                Metrics::book_resync(&market.to_string());
                self.request_snapshot(market, Some(SNAPSHOT_RETRY_DELAY));
            }
        }
    }

    fn invalidate(&mut self, market: MarketId) {
        if let Some(slot) = self.markets.get_mut(&market) {
            slot.sync.reset();
        }
        if self.books.remove(&market).is_some() {
            self.publish(BookEvent::Invalidated { market });
        }
    }

    fn is_current(&self, market: MarketId, generation: u64) -> bool {
        self.markets
            .get(&market)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Start a new snapshot generation, optionally after `delay`.
    fn request_snapshot(&mut self, market: MarketId, delay: Option<Duration>) {
        let Some(slot) = self.markets.get_mut(&market) else {
            return;
        };
        slot.generation += 1;
        let generation = slot.generation;
        match delay {
            None => self.spawn_fetch(market, generation),
            Some(delay) => {
                let tx = self.cmd_tx.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(BookStreamMsg::Fetch { market, generation });
                        }
                    }
                });
            }
        }
    }

    fn spawn_fetch(&self, market: MarketId, generation: u64) {
        debug!(market_id = %market, generation, "Fetching book snapshot");
        let source = Arc::clone(&self.source);
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = source.snapshot(market).await;
            let _ = tx.send(BookStreamMsg::SnapshotResult {
                market,
                generation,
                result,
            });
        });
    }

    fn publish(&mut self, event: BookEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the book stream.
#[derive(Clone)]
pub struct BookStreamHandle {
    tx: mpsc::UnboundedSender<BookStreamMsg>,
    books: Arc<DashMap<MarketId, OrderBookState>>,
}

impl BookStreamHandle {
    /// Start maintaining the book for `market`.
    pub fn track(&self, market: MarketId) -> FeedResult<()> {
        self.send(BookStreamMsg::Track(market))
    }

    pub fn untrack(&self, market: MarketId) -> FeedResult<()> {
        self.send(BookStreamMsg::Untrack(market))
    }

    /// New event sequence. It starts with a `Snapshot` of every live book
    /// and may be dropped and re-created at any time.
    pub fn subscribe(&self) -> FeedResult<mpsc::UnboundedReceiver<BookEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(BookStreamMsg::Subscribe(tx))?;
        Ok(rx)
    }

    /// Latest consistent book, if synchronized.
    pub fn book(&self, market: MarketId) -> Option<OrderBookState> {
        self.books.get(&market).map(|b| b.clone())
    }

    pub fn mid_price(&self, market: MarketId) -> Option<Price> {
        self.books.get(&market).and_then(|b| b.mid())
    }

    pub fn is_synced(&self, market: MarketId) -> bool {
        self.books.contains_key(&market)
    }

    fn send(&self, msg: BookStreamMsg) -> FeedResult<()> {
        self.tx.send(msg).map_err(|_| FeedError::StreamClosed)
    }
}

/// Spawn the book stream actor.
///
/// `events` is the event channel of the public `ConnectionManager`.
pub fn spawn_book_stream(
    source: Arc<dyn SnapshotSource>,
    events: mpsc::Receiver<StreamEvent>,
    shutdown: CancellationToken,
) -> (BookStreamHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let books = Arc::new(DashMap::new());

    let task = BookStreamTask {
        source,
        events,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        markets: HashMap::new(),
        subscribers: Vec::new(),
        books: Arc::clone(&books),
        shutdown,
    };
    let join = tokio::spawn(task.run());

    (BookStreamHandle { tx: cmd_tx, books }, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FakeSnapshotSource;
    use lighter_core::Size;
    use lighter_ws::ChannelMessage;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const MARKET: MarketId = MarketId(0);

    fn snapshot(id: u64) -> BookSnapshot {
        BookSnapshot {
            market: MARKET,
            last_update_id: id,
            bids: vec![BookLevel::new(Price::new(dec!(99)), Size::new(dec!(1)))],
            asks: vec![BookLevel::new(Price::new(dec!(101)), Size::new(dec!(1)))],
            timestamp: 0,
        }
    }

    fn diff_event(first: u64, last: u64, bid: &str) -> StreamEvent {
        StreamEvent::Message(ChannelMessage {
            channel: "orderbook:0".to_string(),
            kind: None,
            data: json!({
                "market_id": 0,
                "first_update_id": first,
                "last_update_id": last,
                "bids": [[bid, "2"]],
                "asks": [],
                "timestamp": last
            }),
        })
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<BookEvent>,
        pred: impl Fn(&BookEvent) -> bool,
    ) -> BookEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for book event")
    }

    fn is_snapshot_at(id: u64) -> impl Fn(&BookEvent) -> bool {
        move |e| matches!(e, BookEvent::Snapshot(s) if s.last_update_id == id)
    }

    struct Harness {
        source: Arc<FakeSnapshotSource>,
        events: mpsc::Sender<StreamEvent>,
        handle: BookStreamHandle,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let source = Arc::new(FakeSnapshotSource::new());
        let (events, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let (handle, _join) = spawn_book_stream(source.clone(), rx, shutdown.clone());
        Harness {
            source,
            events,
            handle,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_sync_then_apply_diff() {
        let h = harness();
        h.source.set(snapshot(100));
        let mut rx = h.handle.subscribe().unwrap();
        h.handle.track(MARKET).unwrap();

        next_matching(&mut rx, is_snapshot_at(100)).await;
        h.events.send(diff_event(101, 101, "99.5")).await.unwrap();

        match next_matching(&mut rx, |e| matches!(e, BookEvent::Delta { .. })).await {
            BookEvent::Delta { update_id, bids, .. } => {
                assert_eq!(update_id, 101);
                assert_eq!(bids[0].price, Price::new(dec!(99.5)));
            }
            other => panic!("unexpected {other:?}"),
        }
        let book = h.handle.book(MARKET).unwrap();
        assert_eq!(book.last_update_id(), 101);
        assert_eq!(h.handle.mid_price(MARKET), Some(Price::new(dec!(100.25))));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_gap_triggers_resync() {
        let h = harness();
        h.source.set(snapshot(100));
        let mut rx = h.handle.subscribe().unwrap();
        h.handle.track(MARKET).unwrap();
        next_matching(&mut rx, is_snapshot_at(100)).await;

        h.source.set(snapshot(200));
        h.events.send(diff_event(105, 106, "98")).await.unwrap();

        next_matching(&mut rx, |e| matches!(e, BookEvent::Invalidated { .. })).await;
        next_matching(&mut rx, is_snapshot_at(200)).await;

        let book = h.handle.book(MARKET).unwrap();
        assert_eq!(book.last_update_id(), 200);
        assert_eq!(book.bid_depth(), 1);
        assert!(h.source.calls(MARKET) >= 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_failure_retries() {
        let h = harness();
        h.source.push(
            MARKET,
            Err(FeedError::SnapshotUnavailable {
                reason: "rate limited".to_string(),
                retry_after: Some(Duration::from_millis(20)),
            }),
        );
        h.source.set(snapshot(50));
        let mut rx = h.handle.subscribe().unwrap();
        h.handle.track(MARKET).unwrap();

        next_matching(&mut rx, is_snapshot_at(50)).await;
        assert_eq!(h.source.calls(MARKET), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_book() {
        let h = harness();
        h.source.set(snapshot(100));
        let mut first = h.handle.subscribe().unwrap();
        h.handle.track(MARKET).unwrap();
        next_matching(&mut first, is_snapshot_at(100)).await;

        let mut late = h.handle.subscribe().unwrap();
        next_matching(&mut late, is_snapshot_at(100)).await;
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_book() {
        let h = harness();
        h.source.set(snapshot(100));
        let mut rx = h.handle.subscribe().unwrap();
        h.handle.track(MARKET).unwrap();
        next_matching(&mut rx, is_snapshot_at(100)).await;

        h.events
            .send(StreamEvent::Disconnected {
                reason: "reset".to_string(),
            })
            .await
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, BookEvent::Invalidated { .. })).await;
        assert!(!h.handle.is_synced(MARKET));

        h.source.set(snapshot(300));
        h.events
            .send(StreamEvent::Connected { reconnect: true })
            .await
            .unwrap();
        next_matching(&mut rx, is_snapshot_at(300)).await;
        assert!(h.handle.is_synced(MARKET));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_trades_forwarded() {
        let h = harness();
        let mut rx = h.handle.subscribe().unwrap();
        h.events
            .send(StreamEvent::Message(ChannelMessage {
                channel: "trades:0".to_string(),
                kind: None,
                data: json!([{"trade_id": 9, "price": "100", "size": "1", "is_buy": true}]),
            }))
            .await
            .unwrap();

        match next_matching(&mut rx, |e| matches!(e, BookEvent::Trade(_))).await {
            BookEvent::Trade(t) => assert_eq!(t.trade_id, 9),
            other => panic!("unexpected {other:?}"),
        }
        h.shutdown.cancel();
    }
}
