//! Per-market order book state.

use std::collections::BTreeMap;

use lighter_core::{BookLevel, BookSnapshot, MarketId, Price, Size};
use rust_decimal::Decimal;

use crate::error::{FeedError, FeedResult};

/// Incremental book update covering `first_update_id..=last_update_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDiff {
    pub market: MarketId,
    pub first_update_id: u64,
    pub last_update_id: u64,
    /// New absolute size per level; zero removes the level.
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: u64,
}

/// Book for one market: price → size per side.
///
/// Zero-size levels are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookState {
    market: MarketId,
    bids: BTreeMap<Price, Size>,
    asks: BTreeMap<Price, Size>,
    last_update_id: u64,
    timestamp: u64,
}

impl OrderBookState {
    pub fn from_snapshot(snapshot: &BookSnapshot) -> Self {
        let mut book = Self {
            market: snapshot.market,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: snapshot.last_update_id,
            timestamp: snapshot.timestamp,
        };
        for level in &snapshot.bids {
            set_level(&mut book.bids, level);
        }
        for level in &snapshot.asks {
            set_level(&mut book.asks, level);
        }
        book
    }

    pub fn market(&self) -> MarketId {
        self.market
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Apply a diff that must chain onto the current update id.
    ///
    /// The book is untouched on error.
    pub fn apply_diff(&mut self, diff: &BookDiff) -> FeedResult<()> {
        let expected = self.last_update_id + 1;
        if diff.first_update_id != expected || diff.last_update_id < diff.first_update_id {
            return Err(FeedError::Desync {
                market: self.market,
                expected,
                got: diff.first_update_id,
            });
        }
        self.apply_levels(diff);
        Ok(())
    }

    /// Apply levels without the chaining check. Used for the first diff that
    /// straddles the snapshot id.
    pub(crate) fn apply_levels(&mut self, diff: &BookDiff) {
        for level in &diff.bids {
            set_level(&mut self.bids, level);
        }
        for level in &diff.asks {
            set_level(&mut self.asks, level);
        }
        self.last_update_id = diff.last_update_id;
        self.timestamp = diff.timestamp;
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(p, s)| BookLevel::new(*p, *s))
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.iter().next().map(|(p, s)| BookLevel::new(*p, *s))
    }

    pub fn mid(&self) -> Option<Price> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some(Price::new((bid.inner() + ask.inner()) / Decimal::TWO))
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Bids best-first.
    pub fn bids(&self) -> Vec<BookLevel> {
        self.bids
            .iter()
            .rev()
            .map(|(p, s)| BookLevel::new(*p, *s))
            .collect()
    }

    /// Asks best-first.
    pub fn asks(&self) -> Vec<BookLevel> {
        self.asks
            .iter()
            .map(|(p, s)| BookLevel::new(*p, *s))
            .collect()
    }

    pub fn to_snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            market: self.market,
            last_update_id: self.last_update_id,
            bids: self.bids(),
            asks: self.asks(),
            timestamp: self.timestamp,
        }
    }
}

fn set_level(side: &mut BTreeMap<Price, Size>, level: &BookLevel) {
    if level.size.is_zero() {
        side.remove(&level.price);
    } else {
        side.insert(level.price, level.size);
    }
}
