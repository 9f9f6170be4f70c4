use lighter_core::{ClientOrderId, OrderState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Unknown order: {0}")]
    UnknownOrder(ClientOrderId),

    #[error("Order {0} is already tracked")]
    DuplicateOrder(ClientOrderId),

    #[error("Order {id} is not cancelable in state {state}")]
    NotCancelable { id: ClientOrderId, state: OrderState },

    #[error("Order status query failed: {0}")]
    Query(#[from] lighter_rest::RestError),

    #[error("Order tracker closed")]
    TrackerClosed,
}

pub type TrackerResult<T> = Result<T, TrackerError>;
