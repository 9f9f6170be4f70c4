//! Where book snapshots come from.

use std::collections::{HashMap, VecDeque};

use lighter_core::{BookSnapshot, BoxFuture, MarketId};
use lighter_rest::LighterApi;
use parking_lot::Mutex;

use crate::error::{FeedError, FeedResult};

/// Snapshot endpoint seam.
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot(&self, market: MarketId) -> BoxFuture<'_, FeedResult<BookSnapshot>>;
}

impl SnapshotSource for LighterApi {
    fn snapshot(&self, market: MarketId) -> BoxFuture<'_, FeedResult<BookSnapshot>> {
        Box::pin(async move { Ok(self.order_book_snapshot(market).await?) })
    }
}

/// Scripted snapshot source for tests.
///
/// Queued results are served first, then the last snapshot set with
/// [`FakeSnapshotSource::set`].
#[derive(Default)]
pub struct FakeSnapshotSource {
    script: Mutex<HashMap<MarketId, VecDeque<FeedResult<BookSnapshot>>>>,
    current: Mutex<HashMap<MarketId, BookSnapshot>>,
    calls: Mutex<HashMap<MarketId, usize>>,
}

impl FakeSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: BookSnapshot) {
        self.current.lock().insert(snapshot.market, snapshot);
    }

    pub fn push(&self, market: MarketId, result: FeedResult<BookSnapshot>) {
        self.script.lock().entry(market).or_default().push_back(result);
    }

    pub fn calls(&self, market: MarketId) -> usize {
        self.calls.lock().get(&market).copied().unwrap_or(0)
    }
}

impl SnapshotSource for FakeSnapshotSource {
    fn snapshot(&self, market: MarketId) -> BoxFuture<'_, FeedResult<BookSnapshot>> {
        Box::pin(async move {
            *self.calls.lock().entry(market).or_insert(0) += 1;
            if let Some(result) = self
                .script
                .lock()
                .get_mut(&market)
                .and_then(VecDeque::pop_front)
            {
                return result;
            }
            self.current
                .lock()
                .get(&market)
                .cloned()
                .ok_or_else(|| FeedError::SnapshotUnavailable {
                    reason: format!("no snapshot for market {market}"),
                    retry_after: None,
                })
        })
    }
}
