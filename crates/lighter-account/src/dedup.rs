//! Natural-key deduplication of user events.

use std::collections::{HashMap, HashSet, VecDeque};

use lighter_core::{Fill, OrderUpdate};

/// Trade ids and order ids remembered before the oldest are forgotten.
pub const DEFAULT_FILL_MEMORY: usize = 100_000;

/// Drops retransmitted events.
///
/// Order updates: only a sequence above the highest seen for that order
/// passes. Fills: each `trade_id` passes once. Both are remembered for the
/// most recent `fill_memory` keys only.
#[derive(Debug)]
pub struct EventDeduplicator {
    order_sequences: HashMap<u64, u64>,
    order_arrival: VecDeque<u64>,
    seen_trades: HashSet<u64>,
    trade_order: VecDeque<u64>,
    fill_memory: usize,
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_FILL_MEMORY)
    }
}

impl EventDeduplicator {
    pub fn new(fill_memory: usize) -> Self {
        Self {
            order_sequences: HashMap::new(),
            order_arrival: VecDeque::new(),
            seen_trades: HashSet::new(),
            trade_order: VecDeque::new(),
            fill_memory: fill_memory.max(1),
        }
    }

    /// True if the update is newer than anything seen for its order.
    pub fn accept_order(&mut self, update: &OrderUpdate) -> bool {
        match self.order_sequences.get(&update.order_id) {
            Some(&seen) if update.sequence <= seen => false,
            Some(_) => {
                self.order_sequences.insert(update.order_id, update.sequence);
                true
            }
            None => {
                self.order_sequences.insert(update.order_id, update.sequence);
                self.order_arrival.push_back(update.order_id);
                if self.order_arrival.len() > self.fill_memory {
                    if let Some(old) = self.order_arrival.pop_front() {
                        self.order_sequences.remove(&old);
                    }
                }
                true
            }
        }
    }

    /// Number of orders whose sequence is remembered.
    pub fn tracked_orders(&self) -> usize {
        self.order_sequences.len()
    }

    /// True the first time a trade id is seen.
    pub fn accept_fill(&mut self, fill: &Fill) -> bool {
        if !self.seen_trades.insert(fill.trade_id) {
            return false;
        }
        self.trade_order.push_back(fill.trade_id);
        if self.trade_order.len() > self.fill_memory {
            if let Some(old) = self.trade_order.pop_front() {
                self.seen_trades.remove(&old);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighter_core::{MarketId, OrderState, Price, Size};
    use rust_decimal::Decimal;

    fn update(order_id: u64, sequence: u64) -> OrderUpdate {
        OrderUpdate {
            order_id,
            client_order_index: None,
            market: MarketId(0),
            state: OrderState::Open,
            sequence,
            filled_amount: None,
            timestamp: 0,
        }
    }

    fn fill(trade_id: u64) -> Fill {
        Fill {
            order_id: 1,
            trade_id,
            market: MarketId(0),
            price: Price::ZERO,
            amount: Size::ZERO,
            fee: Decimal::ZERO,
            timestamp: 0,
        }
    }

    #[test]
    fn test_highest_sequence_wins() {
        let mut d = EventDeduplicator::default();
        assert!(d.accept_order(&update(1, 2)));
        assert!(!d.accept_order(&update(1, 2)));
        // Late, older update
        assert!(!d.accept_order(&update(1, 1)));
        assert!(d.accept_order(&update(1, 3)));
        // Independent per order
        assert!(d.accept_order(&update(2, 1)));
    }

    #[test]
    fn test_fill_once() {
        let mut d = EventDeduplicator::default();
        assert!(d.accept_fill(&fill(10)));
        assert!(!d.accept_fill(&fill(10)));
        assert!(d.accept_fill(&fill(11)));
    }

    #[test]
    fn test_fill_memory_bounded() {
        let mut d = EventDeduplicator::new(2);
        d.accept_fill(&fill(1));
        d.accept_fill(&fill(2));
        d.accept_fill(&fill(3));
        // 1 was evicted
        assert!(d.accept_fill(&fill(1)));
        assert!(!d.accept_fill(&fill(3)));
    }

    #[test]
    fn test_order_memory_bounded() {
        let mut d = EventDeduplicator::new(2);
        for order_id in 1..=50 {
            assert!(d.accept_order(&update(order_id, 1)));
        }
        assert_eq!(d.tracked_orders(), 2);
        // Recent orders still dedup, evicted ones are forgotten
        assert!(!d.accept_order(&update(50, 1)));
        assert!(d.accept_order(&update(1, 1)));
        assert_eq!(d.tracked_orders(), 2);
    }
}
