//! Rate-limited REST access to the Lighter API.
//!
//! Every request is classified into a weight class and checked against a
//! fixed-window budget before it leaves the process. The budget corrects
//! itself from 429 responses instead of trusting local accounting alone.
//!
//! - `RateBudget`: per-class fixed-window accounting with RAII permits
//! - `Dispatcher`: budget check + timeout + status mapping over an
//!   `HttpTransport`
//! - `LighterApi`: typed calls (markets, snapshot, sendTx, nonce, account...)

pub mod api;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod rate_limit;
pub mod transport;

pub use api::{AccountInfo, ExchangeOrder, LighterApi, TxReceipt};
pub use dispatcher::Dispatcher;
pub use endpoints::classify;
pub use error::{RestError, RestResult};
pub use rate_limit::{AccountTier, BudgetPermit, BudgetSnapshot, RateBudget, WeightClass};
pub use transport::{
    FakeTransport, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
    TransportError,
};
