//! Order-status queries used for reconciliation.

use std::collections::HashMap;

use lighter_core::{BoxFuture, ClientOrder, MarketId, OrderUpdate, Size};
use lighter_rest::{ExchangeOrder, LighterApi};
use parking_lot::Mutex;

use crate::error::TrackerResult;

/// Reads the exchange's view of one order.
pub trait OrderQuery: Send + Sync + 'static {
    /// `Ok(None)` when the exchange does not know the order.
    fn order_status(&self, order: ClientOrder) -> BoxFuture<'_, TrackerResult<Option<OrderUpdate>>>;
}

/// Queries the `order` endpoint, by exchange id when known and by client
/// order index otherwise.
pub struct RestOrderQuery {
    api: LighterApi,
    account_index: u64,
}

impl RestOrderQuery {
    pub fn new(api: LighterApi, account_index: u64) -> Self {
        Self { api, account_index }
    }
}

fn to_update(order: ExchangeOrder) -> Option<OrderUpdate> {
    let state = order.state()?;
    Some(OrderUpdate {
        order_id: order.order_index,
        client_order_index: order.client_order_index,
        market: MarketId(order.market_id),
        state,
        sequence: order.timestamp,
        filled_amount: order.filled_amount.map(Size::new),
        timestamp: order.timestamp,
    })
}

impl OrderQuery for RestOrderQuery {
    fn order_status(&self, order: ClientOrder) -> BoxFuture<'_, TrackerResult<Option<OrderUpdate>>> {
        Box::pin(async move {
            let found = match order.exchange_order_id {
                Some(order_index) => self.api.order_status(self.account_index, order_index).await?,
                None => {
                    self.api
                        .order_status_by_client_index(self.account_index, order.client_order_index)
                        .await?
                }
            };
            Ok(found.and_then(to_update))
        })
    }
}

/// Scripted order query for tests. Unscripted orders are unknown.
#[derive(Default)]
pub struct FakeOrderQuery {
    answers: Mutex<HashMap<u64, OrderUpdate>>,
    calls: Mutex<Vec<u64>>,
}

impl FakeOrderQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for the order with this client order index.
    pub fn set(&self, client_order_index: u64, update: OrderUpdate) {
        self.answers.lock().insert(client_order_index, update);
    }

    /// Client order indexes queried so far.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().clone()
    }
}

impl OrderQuery for FakeOrderQuery {
    fn order_status(&self, order: ClientOrder) -> BoxFuture<'_, TrackerResult<Option<OrderUpdate>>> {
        Box::pin(async move {
            self.calls.lock().push(order.client_order_index);
            Ok(self.answers.lock().get(&order.client_order_index).cloned())
        })
    }
}
