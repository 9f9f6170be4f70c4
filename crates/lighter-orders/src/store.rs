//! Order state owned by the tracker task.
//!
//! Every mutation goes through this type and returns the transitions it
//! caused. Re-applying an already applied fill or status update changes
//! nothing and returns no transition.

use std::collections::{HashMap, HashSet, VecDeque};

use lighter_core::{ClientOrder, ClientOrderId, Fill, OrderIntent, OrderState, OrderUpdate, Size};
use tracing::{debug, info, warn};

use crate::error::{TrackerError, TrackerResult};

/// Terminal orders kept for queries and late fills.
pub const DEFAULT_TERMINAL_CAPACITY: usize = 10_000;

/// Exchange order ids with held fills. Fills for orders this process never
/// submitted end up here, so the oldest are dropped.
pub const MAX_ORPHAN_ORDERS: usize = 1_024;

/// One state change of one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub client_order_id: ClientOrderId,
    pub from: OrderState,
    pub to: OrderState,
}

#[derive(Debug, Default)]
struct FillLedger {
    trade_ids: HashSet<u64>,
    /// Sum of applied fills.
    filled: Size,
    /// Highest cumulative amount reported by status updates.
    reported: Size,
}

impl FillLedger {
    fn filled_amount(&self) -> Size {
        self.filled.max(self.reported)
    }
}

pub struct OrderStore {
    orders: HashMap<ClientOrderId, ClientOrder>,
    by_client_index: HashMap<u64, ClientOrderId>,
    by_exchange_id: HashMap<u64, ClientOrderId>,
    ledgers: HashMap<ClientOrderId, FillLedger>,
    /// Fills whose exchange order id is not bound to a local order yet.
    orphan_fills: HashMap<u64, Vec<Fill>>,
    orphan_order: VecDeque<u64>,
    /// State to restore if a cancel never leaves the process.
    pre_cancel: HashMap<ClientOrderId, OrderState>,
    /// Orders that need an order-status query.
    query_queue: HashSet<ClientOrderId>,
    /// Last status query per order (Unix ms).
    last_query_at: HashMap<ClientOrderId, u64>,
    terminal: VecDeque<ClientOrderId>,
    terminal_capacity: usize,
    /// Fills applied since the last drain.
    applied_fills: Vec<(ClientOrderId, Fill)>,
    /// Orders dropped from the terminal store since the last drain.
    evicted: Vec<ClientOrderId>,
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINAL_CAPACITY)
    }
}

impl OrderStore {
    pub fn new(terminal_capacity: usize) -> Self {
        Self {
            orders: HashMap::new(),
            by_client_index: HashMap::new(),
            by_exchange_id: HashMap::new(),
            ledgers: HashMap::new(),
            orphan_fills: HashMap::new(),
            orphan_order: VecDeque::new(),
            pre_cancel: HashMap::new(),
            query_queue: HashSet::new(),
            last_query_at: HashMap::new(),
            terminal: VecDeque::new(),
            terminal_capacity: terminal_capacity.max(1),
            applied_fills: Vec::new(),
            evicted: Vec::new(),
        }
    }

    pub fn get(&self, id: &ClientOrderId) -> Option<&ClientOrder> {
        self.orders.get(id)
    }

    /// Non-terminal orders.
    pub fn live_orders(&self) -> impl Iterator<Item = &ClientOrder> {
        self.orders.values().filter(|o| !o.state.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Fills applied since the last call, including held fills released
    /// by binding an exchange id.
    pub fn drain_fills(&mut self) -> Vec<(ClientOrderId, Fill)> {
        std::mem::take(&mut self.applied_fills)
    }

    /// Terminal orders forgotten since the last call.
    pub fn drain_evicted(&mut self) -> Vec<ClientOrderId> {
        std::mem::take(&mut self.evicted)
    }

    // ------------------------------------------------------------------------
    // Local intents
    // ------------------------------------------------------------------------

    /// Track a signed intent in `PENDING_CREATE`.
    pub fn register(&mut self, intent: &OrderIntent, now_ms: u64) -> TrackerResult<ClientOrder> {
        let id = intent.client_order_id.clone();
        if self.orders.contains_key(&id) {
            return Err(TrackerError::DuplicateOrder(id));
        }
        let order = ClientOrder::from_intent(intent, now_ms);
        self.by_client_index.insert(order.client_order_index, id.clone());
        self.ledgers.insert(id.clone(), FillLedger::default());
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    /// The submission was accepted by the exchange.
    ///
    /// Only promotes PENDING_CREATE: the user stream may already have moved
    /// the order further, and an ack never moves it back. The exchange id is
    /// bound in any state.
    pub fn submit_accepted(
        &mut self,
        id: &ClientOrderId,
        exchange_order_id: Option<u64>,
        now_ms: u64,
    ) -> TrackerResult<Vec<Transition>> {
        self.require(id)?;
        let mut transitions = Vec::new();
        if let Some(exchange_id) = exchange_order_id {
            self.bind(id, exchange_id, now_ms, &mut transitions);
        }
        let Some(state) = self.orders.get(id).map(|o| o.state) else {
            return Ok(transitions);
        };
        match state {
            OrderState::PendingCreate => {
                self.set_reconciling(id, false);
                self.transition(id, OrderState::Open, now_ms, &mut transitions);
            }
            OrderState::PendingCancel => {
                // A rolled-back cancel must restore the acknowledged state
                if let Some(previous) = self.pre_cancel.get_mut(id) {
                    if *previous == OrderState::PendingCreate {
                        *previous = OrderState::Open;
                    }
                }
                debug!(client_order_id = %id, "Ack arrived while cancel pending");
            }
            _ => self.set_reconciling(id, false),
        }
        Ok(transitions)
    }

    /// The exchange definitively refused the submission.
    pub fn submit_rejected(
        &mut self,
        id: &ClientOrderId,
        reason: &str,
        now_ms: u64,
    ) -> TrackerResult<Vec<Transition>> {
        self.require(id)?;
        warn!(client_order_id = %id, %reason, "Order rejected");
        let mut transitions = Vec::new();
        self.transition(id, OrderState::Failed, now_ms, &mut transitions);
        Ok(transitions)
    }

    /// The submission may or may not have reached the exchange.
    pub fn submit_unknown(&mut self, id: &ClientOrderId) -> TrackerResult<()> {
        self.require(id)?;
        info!(client_order_id = %id, "Submission outcome unknown, order left pending");
        self.set_reconciling(id, true);
        Ok(())
    }

    /// Move a cancelable order to `PENDING_CANCEL`.
    pub fn begin_cancel(
        &mut self,
        id: &ClientOrderId,
        now_ms: u64,
    ) -> TrackerResult<(ClientOrder, Vec<Transition>)> {
        let state = self.require(id)?.state;
        if !state.is_cancelable() {
            return Err(TrackerError::NotCancelable {
                id: id.clone(),
                state,
            });
        }
        self.pre_cancel.insert(id.clone(), state);
        let mut transitions = Vec::new();
        self.transition(id, OrderState::PendingCancel, now_ms, &mut transitions);
        let order = self.require(id)?.clone();
        Ok((order, transitions))
    }

    /// Undo `begin_cancel` for a cancel that was never sent.
    pub fn cancel_not_sent(
        &mut self,
        id: &ClientOrderId,
        now_ms: u64,
    ) -> TrackerResult<Vec<Transition>> {
        self.require(id)?;
        let Some(previous) = self.pre_cancel.remove(id) else {
            return Ok(Vec::new());
        };
        let Some(order) = self.orders.get_mut(id) else {
            return Ok(Vec::new());
        };
        if order.state != OrderState::PendingCancel {
            return Ok(Vec::new());
        }
        order.state = previous;
        order.last_transition_at = now_ms;
        Ok(vec![Transition {
            client_order_id: id.clone(),
            from: OrderState::PendingCancel,
            to: previous,
        }])
    }

    /// The cancel was refused. "Order not found" means the order may have
    /// completed in the meantime, so it is queued for a status query.
    pub fn cancel_rejected(
        &mut self,
        id: &ClientOrderId,
        reason: &str,
        not_found: bool,
        now_ms: u64,
    ) -> TrackerResult<Vec<Transition>> {
        self.require(id)?;
        let mut transitions = Vec::new();
        if not_found {
            info!(client_order_id = %id, "Cancel target not found, reconciling");
            self.request_query(id);
        } else {
            warn!(client_order_id = %id, %reason, "Cancel rejected");
            self.transition(id, OrderState::Failed, now_ms, &mut transitions);
        }
        Ok(transitions)
    }

    /// The cancel may or may not have reached the exchange.
    pub fn cancel_unknown(&mut self, id: &ClientOrderId) -> TrackerResult<()> {
        self.require(id)?;
        self.set_reconciling(id, true);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Exchange events
    // ------------------------------------------------------------------------

    /// Apply a streamed status update. Updates at or below the highest
    /// applied sequence are ignored.
    pub fn apply_update(&mut self, update: &OrderUpdate, now_ms: u64) -> Vec<Transition> {
        self.apply_status(update, false, now_ms)
    }

    /// Apply a status read over REST. Bypasses sequence ordering.
    pub fn apply_authoritative(&mut self, update: &OrderUpdate, now_ms: u64) -> Vec<Transition> {
        self.apply_status(update, true, now_ms)
    }

    fn apply_status(
        &mut self,
        update: &OrderUpdate,
        authoritative: bool,
        now_ms: u64,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let Some(id) = self.resolve(update.order_id, update.client_order_index) else {
            debug!(order_index = update.order_id, "Status update for untracked order");
            return transitions;
        };
        self.bind(&id, update.order_id, now_ms, &mut transitions);

        let Some(order) = self.orders.get_mut(&id) else {
            return transitions;
        };
        if !authoritative {
            if order.last_sequence > 0 && update.sequence <= order.last_sequence {
                debug!(client_order_id = %id, sequence = update.sequence, "Stale status update");
                return transitions;
            }
            order.last_sequence = update.sequence;
        }

        if let (Some(reported), Some(ledger)) = (update.filled_amount, self.ledgers.get_mut(&id)) {
            ledger.reported = ledger.reported.max(reported);
        }
        self.refresh_filled(&id);
        self.set_reconciling(&id, false);
        self.query_queue.remove(&id);

        let Some(order) = self.orders.get(&id) else {
            return transitions;
        };
        let target = match (order.state, update.state) {
            (_, OrderState::PendingCreate) => None,
            // A resting order stays PENDING_CANCEL until the cancel resolves
            (OrderState::PendingCancel, OrderState::Open | OrderState::PartiallyFilled) => None,
            (_, OrderState::Open) if order.filled_amount.is_positive() => {
                Some(OrderState::PartiallyFilled)
            }
            (_, state) => Some(state),
        };
        if let Some(target) = target {
            self.transition(&id, target, now_ms, &mut transitions);
        }
        transitions
    }

    /// Apply a fill. Each `trade_id` counts once per order.
    ///
    /// Returns `None` if the fill was a duplicate or its order is unknown
    /// (the fill is then held until the order id is bound).
    pub fn apply_fill(
        &mut self,
        fill: &Fill,
        now_ms: u64,
    ) -> Option<(ClientOrderId, Vec<Transition>)> {
        let Some(id) = self.by_exchange_id.get(&fill.order_id).cloned() else {
            debug!(order_index = fill.order_id, trade_id = fill.trade_id, "Fill for unbound order held");
            self.hold_fill(fill);
            return None;
        };
        let mut transitions = Vec::new();
        self.apply_bound_fill(&id, fill, now_ms, &mut transitions)
            .then_some((id, transitions))
    }

    fn hold_fill(&mut self, fill: &Fill) {
        if !self.orphan_fills.contains_key(&fill.order_id) {
            self.orphan_order.push_back(fill.order_id);
            while self.orphan_order.len() > MAX_ORPHAN_ORDERS {
                if let Some(old) = self.orphan_order.pop_front() {
                    self.orphan_fills.remove(&old);
                }
            }
        }
        let held = self.orphan_fills.entry(fill.order_id).or_default();
        if !held.iter().any(|f| f.trade_id == fill.trade_id) {
            held.push(fill.clone());
        }
    }

    fn apply_bound_fill(
        &mut self,
        id: &ClientOrderId,
        fill: &Fill,
        now_ms: u64,
        transitions: &mut Vec<Transition>,
    ) -> bool {
        let ledger = self.ledgers.entry(id.clone()).or_default();
        if !ledger.trade_ids.insert(fill.trade_id) {
            return false;
        }
        ledger.filled = ledger.filled + fill.amount;
        self.refresh_filled(id);
        self.applied_fills.push((id.clone(), fill.clone()));

        let Some(order) = self.orders.get(id) else {
            return true;
        };
        let target = match order.state {
            OrderState::PendingCreate | OrderState::Open | OrderState::PartiallyFilled => {
                if order.is_fully_filled() {
                    Some(OrderState::Filled)
                } else {
                    Some(OrderState::PartiallyFilled)
                }
            }
            OrderState::PendingCancel if order.is_fully_filled() => Some(OrderState::Filled),
            _ => None,
        };
        if let Some(target) = target {
            self.transition(id, target, now_ms, transitions);
        }
        true
    }

    /// Open orders according to REST. Local orders that should be resting
    /// but are missing from the list are queued for a status query.
    pub fn reconcile_open_orders(
        &mut self,
        open_orders: &[OrderUpdate],
        now_ms: u64,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let mut present = HashSet::new();
        for update in open_orders {
            if let Some(id) = self.resolve(update.order_id, update.client_order_index) {
                present.insert(id);
                transitions.extend(self.apply_authoritative(update, now_ms));
            }
        }
        let missing: Vec<_> = self
            .live_orders()
            .filter(|o| !present.contains(&o.client_order_id))
            .map(|o| o.client_order_id.clone())
            .collect();
        for id in missing {
            self.request_query(&id);
        }
        transitions
    }

    /// Result of an order-status query. `None` means the exchange does not
    /// know the order.
    pub fn apply_query_result(
        &mut self,
        id: &ClientOrderId,
        result: Option<&OrderUpdate>,
        now_ms: u64,
    ) -> Vec<Transition> {
        match result {
            Some(update) => {
                let mut transitions = Vec::new();
                // The query was issued for `id`; bind even if the venue
                // echoed no client index
                self.bind(id, update.order_id, now_ms, &mut transitions);
                transitions.extend(self.apply_authoritative(update, now_ms));
                transitions
            }
            None => {
                let Some(order) = self.orders.get(id) else {
                    return Vec::new();
                };
                let target = match order.state {
                    OrderState::PendingCreate => OrderState::Failed,
                    OrderState::Open | OrderState::PartiallyFilled | OrderState::PendingCancel => {
                        OrderState::Canceled
                    }
                    _ => return Vec::new(),
                };
                info!(client_order_id = %id, %target, "Order unknown to exchange");
                self.set_reconciling(id, false);
                self.query_queue.remove(id);
                let mut transitions = Vec::new();
                self.transition(id, target, now_ms, &mut transitions);
                transitions
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation scheduling
    // ------------------------------------------------------------------------

    /// Queue a status query and flag the order as reconciling.
    pub fn request_query(&mut self, id: &ClientOrderId) {
        if self.orders.get(id).is_some_and(|o| !o.state.is_terminal()) {
            self.set_reconciling(id, true);
            self.query_queue.insert(id.clone());
        }
    }

    /// Orders due for a status query: queued ones, plus pending orders
    /// unacknowledged for `timeout_ms`. Marks them as queried at `now_ms`.
    pub fn due_queries(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<ClientOrder> {
        let stuck: Vec<_> = self
            .orders
            .values()
            .filter(|o| matches!(o.state, OrderState::PendingCreate | OrderState::PendingCancel))
            .filter(|o| {
                let since = o
                    .last_transition_at
                    .max(self.last_query_at.get(&o.client_order_id).copied().unwrap_or(0));
                now_ms.saturating_sub(since) >= timeout_ms
            })
            .map(|o| o.client_order_id.clone())
            .collect();
        for id in stuck {
            self.request_query(&id);
        }

        let due: Vec<_> = self.query_queue.drain().collect();
        due.into_iter()
            .filter_map(|id| {
                self.last_query_at.insert(id.clone(), now_ms);
                self.orders.get(&id).filter(|o| !o.state.is_terminal()).cloned()
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn require(&self, id: &ClientOrderId) -> TrackerResult<&ClientOrder> {
        self.orders
            .get(id)
            .ok_or_else(|| TrackerError::UnknownOrder(id.clone()))
    }

    fn resolve(&self, exchange_id: u64, client_index: Option<u64>) -> Option<ClientOrderId> {
        self.by_exchange_id
            .get(&exchange_id)
            .or_else(|| client_index.and_then(|idx| self.by_client_index.get(&idx)))
            .cloned()
    }

    /// Record the exchange id and apply any fills held for it.
    fn bind(
        &mut self,
        id: &ClientOrderId,
        exchange_id: u64,
        now_ms: u64,
        transitions: &mut Vec<Transition>,
    ) {
        let Some(order) = self.orders.get_mut(id) else {
            return;
        };
        if order.exchange_order_id == Some(exchange_id) {
            return;
        }
        order.exchange_order_id = Some(exchange_id);
        self.by_exchange_id.insert(exchange_id, id.clone());
        debug!(client_order_id = %id, order_index = exchange_id, "Exchange order id bound");

        if let Some(held) = self.orphan_fills.remove(&exchange_id) {
            self.orphan_order.retain(|o| *o != exchange_id);
            for fill in held {
                self.apply_bound_fill(id, &fill, now_ms, transitions);
            }
        }
    }

    fn refresh_filled(&mut self, id: &ClientOrderId) {
        let filled = self.ledgers.get(id).map(FillLedger::filled_amount);
        if let (Some(filled), Some(order)) = (filled, self.orders.get_mut(id)) {
            order.filled_amount = filled;
        }
    }

    fn set_reconciling(&mut self, id: &ClientOrderId, reconciling: bool) {
        if let Some(order) = self.orders.get_mut(id) {
            order.reconciling = reconciling && !order.state.is_terminal();
        }
    }

    /// Apply a legal transition; illegal or same-state moves are no-ops.
    fn transition(
        &mut self,
        id: &ClientOrderId,
        to: OrderState,
        now_ms: u64,
        transitions: &mut Vec<Transition>,
    ) {
        let Some(order) = self.orders.get_mut(id) else {
            return;
        };
        let from = order.state;
        if !from.can_transition_to(to) {
            if from != to {
                debug!(client_order_id = %id, %from, %to, "Ignoring illegal transition");
            }
            return;
        }
        order.state = to;
        order.last_transition_at = now_ms;
        if from == OrderState::PendingCancel {
            self.pre_cancel.remove(id);
        }
        if to.is_terminal() {
            order.reconciling = false;
            self.query_queue.remove(id);
            self.retire(id.clone());
        }
        debug!(client_order_id = %id, %from, %to, "Order transition");
        transitions.push(Transition {
            client_order_id: id.clone(),
            from,
            to,
        });
    }

    /// Keep a bounded number of terminal orders.
    fn retire(&mut self, id: ClientOrderId) {
        self.terminal.push_back(id);
        while self.terminal.len() > self.terminal_capacity {
            let Some(old) = self.terminal.pop_front() else {
                break;
            };
            if let Some(order) = self.orders.remove(&old) {
                self.by_client_index.remove(&order.client_order_index);
                if let Some(exchange_id) = order.exchange_order_id {
                    self.by_exchange_id.remove(&exchange_id);
                }
            }
            self.ledgers.remove(&old);
            self.last_query_at.remove(&old);
            self.evicted.push(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighter_core::{MarketId, OrderSide, Price};
    use rust_decimal_macros::dec;

    fn intent() -> OrderIntent {
        OrderIntent::limit(
            MarketId(0),
            OrderSide::Buy,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
        )
    }

    fn fill(order_id: u64, trade_id: u64, amount: rust_decimal::Decimal) -> Fill {
        Fill {
            order_id,
            trade_id,
            market: MarketId(0),
            price: Price::new(dec!(100)),
            amount: Size::new(amount),
            fee: dec!(0),
            timestamp: 0,
        }
    }

    fn update(order_id: u64, state: OrderState, sequence: u64) -> OrderUpdate {
        OrderUpdate {
            order_id,
            client_order_index: None,
            market: MarketId(0),
            state,
            sequence,
            filled_amount: None,
            timestamp: 0,
        }
    }

    fn open_order(store: &mut OrderStore) -> ClientOrderId {
        let intent = intent();
        store.register(&intent, 0).unwrap();
        store
            .submit_accepted(&intent.client_order_id, Some(7), 1)
            .unwrap();
        intent.client_order_id
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut store = OrderStore::default();
        let intent = intent();
        store.register(&intent, 0).unwrap();
        assert!(matches!(
            store.register(&intent, 0),
            Err(TrackerError::DuplicateOrder(_))
        ));
    }

    #[test]
    fn test_duplicate_fill_is_noop() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);

        let (_, first) = store.apply_fill(&fill(7, 1, dec!(4)), 2).unwrap();
        assert_eq!(first[0].to, OrderState::PartiallyFilled);
        let before = store.get(&id).unwrap().clone();

        assert!(store.apply_fill(&fill(7, 1, dec!(4)), 3).is_none());
        assert_eq!(store.get(&id).unwrap(), &before);
    }

    #[test]
    fn test_duplicate_status_is_noop() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);

        let t = store.apply_update(&update(7, OrderState::Canceled, 5), 2);
        assert_eq!(t.len(), 1);
        let before = store.get(&id).unwrap().clone();
        assert!(store.apply_update(&update(7, OrderState::Canceled, 5), 3).is_empty());
        assert_eq!(store.get(&id).unwrap(), &before);
    }

    #[test]
    fn test_out_of_order_status_highest_wins() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);
        store.apply_update(&update(7, OrderState::PartiallyFilled, 3), 2);
        // Older sequence arrives late
        assert!(store.apply_update(&update(7, OrderState::Open, 2), 3).is_empty());
        assert_eq!(store.get(&id).unwrap().state, OrderState::PartiallyFilled);
    }

    #[test]
    fn test_status_binds_by_client_index() {
        let mut store = OrderStore::default();
        let intent = intent();
        let order = store.register(&intent, 0).unwrap();

        let mut u = update(55, OrderState::Open, 1);
        u.client_order_index = Some(order.client_order_index);
        let t = store.apply_update(&u, 1);

        assert_eq!(t[0].to, OrderState::Open);
        assert_eq!(store.get(&intent.client_order_id).unwrap().exchange_order_id, Some(55));
    }

    #[test]
    fn test_fill_before_binding_is_held() {
        let mut store = OrderStore::default();
        let intent = intent();
        let order = store.register(&intent, 0).unwrap();

        assert!(store.apply_fill(&fill(55, 1, dec!(10)), 1).is_none());

        let mut u = update(55, OrderState::Open, 1);
        u.client_order_index = Some(order.client_order_index);
        let t = store.apply_update(&u, 2);

        let tracked = store.get(&intent.client_order_id).unwrap();
        assert_eq!(tracked.state, OrderState::Filled);
        assert!(t.iter().any(|t| t.to == OrderState::Filled));
    }

    #[test]
    fn test_reported_and_fill_amounts_not_double_counted() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);

        let mut u = update(7, OrderState::PartiallyFilled, 1);
        u.filled_amount = Some(Size::new(dec!(4)));
        store.apply_update(&u, 1);
        store.apply_fill(&fill(7, 1, dec!(4)), 2);

        assert_eq!(store.get(&id).unwrap().filled_amount, Size::new(dec!(4)));
    }

    #[test]
    fn test_cancel_path() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);

        let (order, t) = store.begin_cancel(&id, 2).unwrap();
        assert_eq!(order.state, OrderState::PendingCancel);
        assert_eq!(t[0].from, OrderState::Open);

        // Resting update does not undo the pending cancel
        assert!(store.apply_update(&update(7, OrderState::Open, 1), 3).is_empty());

        let t = store.apply_update(&update(7, OrderState::Canceled, 2), 4);
        assert_eq!(t[0].to, OrderState::Canceled);
        assert!(store.live_orders().next().is_none());
    }

    #[test]
    fn test_cancel_not_sent_restores_state() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);
        store.apply_fill(&fill(7, 1, dec!(2)), 2);

        store.begin_cancel(&id, 3).unwrap();
        let t = store.cancel_not_sent(&id, 4).unwrap();
        assert_eq!(t[0].to, OrderState::PartiallyFilled);
        assert_eq!(store.get(&id).unwrap().state, OrderState::PartiallyFilled);
    }

    #[test]
    fn test_late_ack_keeps_partial_fill() {
        let mut store = OrderStore::default();
        let intent = intent();
        let order = store.register(&intent, 0).unwrap();

        let mut u = update(55, OrderState::Open, 1);
        u.client_order_index = Some(order.client_order_index);
        store.apply_update(&u, 1);
        store.apply_fill(&fill(55, 1, dec!(4)), 2);

        let t = store
            .submit_accepted(&intent.client_order_id, Some(55), 3)
            .unwrap();
        assert!(t.is_empty());
        let tracked = store.get(&intent.client_order_id).unwrap();
        assert_eq!(tracked.state, OrderState::PartiallyFilled);
        assert_eq!(tracked.filled_amount, Size::new(dec!(4)));
    }

    #[test]
    fn test_ack_during_pending_cancel_binds_and_rolls_back_to_open() {
        let mut store = OrderStore::default();
        let intent = intent();
        let id = intent.client_order_id.clone();
        store.register(&intent, 0).unwrap();
        store.begin_cancel(&id, 1).unwrap();

        let t = store.submit_accepted(&id, Some(55), 2).unwrap();
        assert!(t.is_empty());
        let tracked = store.get(&id).unwrap();
        assert_eq!(tracked.state, OrderState::PendingCancel);
        assert_eq!(tracked.exchange_order_id, Some(55));

        // The cancel never left; the order is acknowledged now
        let t = store.cancel_not_sent(&id, 3).unwrap();
        assert_eq!(t[0].to, OrderState::Open);
        assert_eq!(store.get(&id).unwrap().exchange_order_id, Some(55));
    }

    #[test]
    fn test_cancel_rejections() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);
        store.begin_cancel(&id, 2).unwrap();

        // Not found: reconcile instead of failing
        assert!(store.cancel_rejected(&id, "order not found", true, 3).unwrap().is_empty());
        assert!(store.get(&id).unwrap().reconciling);
        let due = store.due_queries(4, 10_000);
        assert_eq!(due.len(), 1);

        let t = store.cancel_rejected(&id, "bad signature", false, 5).unwrap();
        assert_eq!(t[0].to, OrderState::Failed);
    }

    #[test]
    fn test_filled_order_not_cancelable() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);
        store.apply_fill(&fill(7, 1, dec!(10)), 2);

        match store.begin_cancel(&id, 3) {
            Err(TrackerError::NotCancelable { state, .. }) => assert_eq!(state, OrderState::Filled),
            other => panic!("expected NotCancelable, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_create_timeout_queues_query() {
        let mut store = OrderStore::default();
        let intent = intent();
        store.register(&intent, 1_000).unwrap();
        store.submit_unknown(&intent.client_order_id).unwrap();
        assert!(store.get(&intent.client_order_id).unwrap().reconciling);

        assert!(store.due_queries(5_000, 10_000).is_empty());
        assert_eq!(store.due_queries(11_000, 10_000).len(), 1);
        // Not re-queried until another timeout passes
        assert!(store.due_queries(12_000, 10_000).is_empty());
        assert_eq!(store.due_queries(21_000, 10_000).len(), 1);
    }

    #[test]
    fn test_query_not_found_fails_pending_create() {
        let mut store = OrderStore::default();
        let intent = intent();
        store.register(&intent, 0).unwrap();
        let t = store.apply_query_result(&intent.client_order_id, None, 1);
        assert_eq!(t[0].to, OrderState::Failed);
    }

    #[test]
    fn test_query_found_resolves_timeout_once() {
        let mut store = OrderStore::default();
        let intent = intent();
        store.register(&intent, 0).unwrap();
        store.submit_unknown(&intent.client_order_id).unwrap();

        let found = update(9, OrderState::Open, 0);
        let t = store.apply_query_result(&intent.client_order_id, Some(&found), 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, OrderState::Open);
        // Same answer again changes nothing
        assert!(store
            .apply_query_result(&intent.client_order_id, Some(&found), 2)
            .is_empty());

        let order = store.get(&intent.client_order_id).unwrap();
        assert_eq!(order.exchange_order_id, Some(9));
        assert!(!order.reconciling);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reconcile_open_orders_queries_missing() {
        let mut store = OrderStore::default();
        let id = open_order(&mut store);
        let other = intent();
        store.register(&other, 0).unwrap();
        store
            .submit_accepted(&other.client_order_id, Some(8), 1)
            .unwrap();

        store.reconcile_open_orders(&[update(8, OrderState::Open, 1)], 2);

        assert!(store.get(&id).unwrap().reconciling);
        assert!(!store.get(&other.client_order_id).unwrap().reconciling);
        let due: Vec<_> = store
            .due_queries(3, 10_000)
            .into_iter()
            .map(|o| o.client_order_id)
            .collect();
        assert_eq!(due, vec![id]);
    }

    #[test]
    fn test_terminal_capacity_bounded() {
        let mut store = OrderStore::new(2);
        for _ in 0..4 {
            let intent = intent();
            store.register(&intent, 0).unwrap();
            store
                .submit_rejected(&intent.client_order_id, "bad price", 1)
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.drain_evicted().len(), 2);
    }

    #[test]
    fn test_released_fills_are_reported() {
        let mut store = OrderStore::default();
        let intent = intent();
        store.register(&intent, 0).unwrap();
        store.apply_fill(&fill(55, 1, dec!(3)), 1);
        assert!(store.drain_fills().is_empty());

        store
            .submit_accepted(&intent.client_order_id, Some(55), 2)
            .unwrap();
        let fills = store.drain_fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].0, intent.client_order_id);
        assert_eq!(
            store.get(&intent.client_order_id).unwrap().state,
            OrderState::PartiallyFilled
        );
    }
}
