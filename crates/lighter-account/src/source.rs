//! REST state used to close the gap after a reconnect.

use std::collections::VecDeque;
use std::time::Duration;

use lighter_core::{BoxFuture, Fill, MarketId, OrderUpdate, Position, Size};
use lighter_rest::{ExchangeOrder, LighterApi};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::AccountResult;

/// Exchange-side view of the account at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub open_orders: Vec<OrderUpdate>,
    /// Most recent fills; may overlap fills already delivered live.
    pub recent_fills: Vec<Fill>,
    /// Empty unless positions were requested.
    pub positions: Vec<Position>,
}

pub trait AccountSource: Send + Sync + 'static {
    fn snapshot(
        &self,
        account_index: u64,
        include_positions: bool,
    ) -> BoxFuture<'_, AccountResult<AccountSnapshot>>;
}

fn to_update(order: ExchangeOrder) -> Option<OrderUpdate> {
    let Some(state) = order.state() else {
        warn!(order_index = order.order_index, status = %order.status, "Unknown order status");
        return None;
    };
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

impl AccountSource for LighterApi {
    fn snapshot(
        &self,
        account_index: u64,
        include_positions: bool,
    ) -> BoxFuture<'_, AccountResult<AccountSnapshot>> {
        Box::pin(async move {
            let open_orders = self
                .active_orders(account_index, None)
                .await?
                .into_iter()
                .filter_map(to_update)
                .collect();
            let recent_fills = self.trades(account_index, None).await?;
            let positions = if include_positions {
                self.positions(account_index).await?
            } else {
                Vec::new()
            };
            Ok(AccountSnapshot {
                open_orders,
                recent_fills,
                positions,
            })
        })
    }
}

/// Scripted account source for tests.
#[derive(Default)]
pub struct FakeAccountSource {
    script: Mutex<VecDeque<AccountResult<AccountSnapshot>>>,
    current: Mutex<AccountSnapshot>,
    calls: Mutex<usize>,
    delay: Mutex<Option<Duration>>,
}

impl FakeAccountSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Served once the script is empty.
    pub fn set(&self, snapshot: AccountSnapshot) {
        *self.current.lock() = snapshot;
    }

    pub fn push(&self, result: AccountResult<AccountSnapshot>) {
        self.script.lock().push_back(result);
    }

    /// Sleep this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl AccountSource for FakeAccountSource {
    fn snapshot(
        &self,
        _account_index: u64,
        _include_positions: bool,
    ) -> BoxFuture<'_, AccountResult<AccountSnapshot>> {
        Box::pin(async move {
            *self.calls.lock() += 1;
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(result) = self.script.lock().pop_front() {
                return result;
            }
            Ok(self.current.lock().clone())
        })
    }
}
