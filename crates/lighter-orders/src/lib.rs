//! Order tracker for the Lighter connector.
//!
//! Owns every locally submitted order and drives it through
//! `PENDING_CREATE → OPEN → PARTIALLY_FILLED → FILLED` and the cancel path,
//! from two independent inputs: submit/cancel outcomes reported by the
//! caller and the user stream. Ambiguous outcomes are settled with
//! explicit order-status queries.

pub mod error;
pub mod query;
pub mod store;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use query::{FakeOrderQuery, OrderQuery, RestOrderQuery};
pub use store::{OrderStore, Transition};
pub use tracker::{
    spawn_order_tracker, CancelOutcome, OrderEvent, OrderTrackerHandle, SubmitOutcome,
    TrackerConfig,
};
