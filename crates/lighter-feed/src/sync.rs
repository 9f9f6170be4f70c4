//! Snapshot + diff synchronization for one market.
//!
//! Diffs arriving before the snapshot are buffered. When the snapshot lands,
//! buffered diffs at or below its id are dropped, the first remaining diff
//! must straddle `snapshot.last_update_id + 1`, and every later diff must
//! chain exactly. Any break drops the book and waits for a new snapshot.

use std::collections::VecDeque;

use lighter_core::{BookSnapshot, MarketId};
use tracing::{debug, warn};

use crate::book::{BookDiff, OrderBookState};
use crate::error::{FeedError, FeedResult};

/// Diffs kept while waiting for a snapshot. Oldest are dropped first.
pub const MAX_BUFFERED_DIFFS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Held until the snapshot arrives.
    Buffered,
    /// Applied to the live book.
    Applied,
    /// Already covered by the book; ignored.
    Stale,
}

#[derive(Debug)]
enum Phase {
    AwaitingSnapshot { buffer: VecDeque<BookDiff> },
    Live(OrderBookState),
}

#[derive(Debug)]
pub struct BookSynchronizer {
    market: MarketId,
    phase: Phase,
}

impl BookSynchronizer {
    pub fn new(market: MarketId) -> Self {
        Self {
            market,
            phase: Phase::AwaitingSnapshot {
                buffer: VecDeque::new(),
            },
        }
    }

    pub fn market(&self) -> MarketId {
        self.market
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live(_))
    }

    pub fn book(&self) -> Option<&OrderBookState> {
        match &self.phase {
            Phase::Live(book) => Some(book),
            Phase::AwaitingSnapshot { .. } => None,
        }
    }

    pub fn buffered(&self) -> usize {
        match &self.phase {
            Phase::AwaitingSnapshot { buffer } => buffer.len(),
            Phase::Live(_) => 0,
        }
    }

    /// Drop all state and wait for a new snapshot.
    pub fn reset(&mut self) {
        self.phase = Phase::AwaitingSnapshot {
            buffer: VecDeque::new(),
        };
    }

    /// Feed one diff.
    ///
    /// On `Desync` the book has already been dropped and the offending diff
    /// buffered; the caller must fetch a new snapshot.
    pub fn on_diff(&mut self, diff: BookDiff) -> FeedResult<DiffOutcome> {
        match &mut self.phase {
            Phase::AwaitingSnapshot { buffer } => {
                if buffer.len() >= MAX_BUFFERED_DIFFS {
                    buffer.pop_front();
                }
                buffer.push_back(diff);
                Ok(DiffOutcome::Buffered)
            }
            Phase::Live(book) => {
                if diff.last_update_id <= book.last_update_id() {
                    return Ok(DiffOutcome::Stale);
                }
                match book.apply_diff(&diff) {
                    Ok(()) => Ok(DiffOutcome::Applied),
                    Err(e) => {
                        warn!(market_id = %self.market, error = %e, "Book gap detected, resyncing");
                        let mut buffer = VecDeque::new();
                        buffer.push_back(diff);
                        self.phase = Phase::AwaitingSnapshot { buffer };
                        Err(e)
                    }
                }
            }
        }
    }

    /// Install a snapshot and replay buffered diffs onto it.
    ///
    /// Returns the replayed diffs. On `Desync` the snapshot is discarded and
    /// newer buffered diffs are kept for the next attempt.
    pub fn on_snapshot(&mut self, snapshot: &BookSnapshot) -> FeedResult<Vec<BookDiff>> {
        let buffer = match &mut self.phase {
            Phase::AwaitingSnapshot { buffer } => std::mem::take(buffer),
            Phase::Live(_) => VecDeque::new(),
        };
        let snap_id = snapshot.last_update_id;
        let pending: VecDeque<BookDiff> = buffer
            .into_iter()
            .filter(|d| d.last_update_id > snap_id)
            .collect();

        let mut book = OrderBookState::from_snapshot(snapshot);
        let mut replayed = Vec::with_capacity(pending.len());
        for (i, diff) in pending.iter().enumerate() {
            let result = if i == 0 {
                if diff.first_update_id <= snap_id + 1 {
                    book.apply_levels(diff);
                    Ok(())
                } else {
                    Err(FeedError::Desync {
                        market: self.market,
                        expected: snap_id + 1,
                        got: diff.first_update_id,
                    })
                }
            } else {
                book.apply_diff(diff)
            };
            if let Err(e) = result {
                warn!(
                    market_id = %self.market,
                    snapshot_id = snap_id,
                    error = %e,
                    "Buffered diffs do not chain onto snapshot"
                );
                self.phase = Phase::AwaitingSnapshot {
                    buffer: pending.into_iter().skip(i).collect(),
                };
                return Err(e);
            }
            replayed.push(diff.clone());
        }

        debug!(
            market_id = %self.market,
            snapshot_id = snap_id,
            replayed = replayed.len(),
            last_update_id = book.last_update_id(),
            "Book live"
        );
        self.phase = Phase::Live(book);
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighter_core::{BookLevel, Price, Size};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn lvl(p: Decimal, s: Decimal) -> BookLevel {
        BookLevel::new(Price::new(p), Size::new(s))
    }

    fn snap(id: u64) -> BookSnapshot {
        BookSnapshot {
            market: MarketId(0),
            last_update_id: id,
            bids: vec![lvl(dec!(10), dec!(1))],
            asks: vec![lvl(dec!(11), dec!(1))],
            timestamp: 0,
        }
    }

    fn diff(first: u64, last: u64, bid: Decimal) -> BookDiff {
        BookDiff {
            market: MarketId(0),
            first_update_id: first,
            last_update_id: last,
            bids: vec![lvl(bid, dec!(1))],
            asks: vec![],
            timestamp: last,
        }
    }

    #[test]
    fn test_buffer_then_replay_straddling_diff() {
        let mut sync = BookSynchronizer::new(MarketId(0));
        assert_eq!(sync.on_diff(diff(95, 98, dec!(5))).unwrap(), DiffOutcome::Buffered);
        assert_eq!(sync.on_diff(diff(99, 102, dec!(6))).unwrap(), DiffOutcome::Buffered);
        assert_eq!(sync.on_diff(diff(103, 103, dec!(7))).unwrap(), DiffOutcome::Buffered);

        let replayed = sync.on_snapshot(&snap(100)).unwrap();
        assert_eq!(replayed.len(), 2);

        let book = sync.book().unwrap();
        assert_eq!(book.last_update_id(), 103);
        assert_eq!(book.bid_depth(), 3);
        // Level 5 came from a diff fully covered by the snapshot
        assert!(book.bids().iter().all(|l| l.price != Price::new(dec!(5))));
    }

    #[test]
    fn test_snapshot_older_than_buffer_is_rejected() {
        let mut sync = BookSynchronizer::new(MarketId(0));
        sync.on_diff(diff(110, 112, dec!(6))).unwrap();

        let err = sync.on_snapshot(&snap(100)).unwrap_err();
        assert!(err.is_desync());
        assert!(!sync.is_live());
        assert_eq!(sync.buffered(), 1);

        // A fresher snapshot picks up the kept diff
        sync.on_snapshot(&snap(109)).unwrap();
        assert_eq!(sync.book().unwrap().last_update_id(), 112);
    }

    #[test]
    fn test_live_gap_drops_book() {
        let mut sync = BookSynchronizer::new(MarketId(0));
        sync.on_snapshot(&snap(100)).unwrap();
        assert_eq!(sync.on_diff(diff(101, 101, dec!(6))).unwrap(), DiffOutcome::Applied);

        let err = sync.on_diff(diff(105, 106, dec!(7))).unwrap_err();
        assert!(err.is_desync());
        assert!(sync.book().is_none());
        assert_eq!(sync.buffered(), 1);
    }

    #[test]
    fn test_stale_diff_ignored() {
        let mut sync = BookSynchronizer::new(MarketId(0));
        sync.on_snapshot(&snap(100)).unwrap();
        assert_eq!(sync.on_diff(diff(99, 100, dec!(6))).unwrap(), DiffOutcome::Stale);
        assert_eq!(sync.book().unwrap().last_update_id(), 100);
    }

    #[test]
    fn test_reset_clears_buffer() {
        let mut sync = BookSynchronizer::new(MarketId(0));
        sync.on_diff(diff(1, 2, dec!(6))).unwrap();
        sync.reset();
        assert_eq!(sync.buffered(), 0);
        assert!(!sync.is_live());
    }
}
