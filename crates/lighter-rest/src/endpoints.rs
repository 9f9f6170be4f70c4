//! REST paths and their weight classes.

use crate::rate_limit::WeightClass;

pub const ORDER_BOOKS: &str = "/api/v1/orderBooks";
pub const ORDER_BOOK_DETAILS: &str = "/api/v1/orderBookDetails";
pub const SEND_TX: &str = "/api/v1/sendTx";
pub const SEND_TX_BATCH: &str = "/api/v1/sendTxBatch";
pub const NEXT_NONCE: &str = "/api/v1/nextNonce";
pub const ORDER: &str = "/api/v1/order";
pub const ACTIVE_ORDERS: &str = "/api/v1/accountActiveOrders";
pub const ACCOUNT: &str = "/api/v1/account";
pub const TRADES: &str = "/api/v1/trades";
pub const POSITIONS: &str = "/api/v1/positions";
pub const FUNDING: &str = "/api/v1/funding";
pub const STATUS: &str = "/api/v1/status";

pub const ORDER_NOT_EXIST_MESSAGE: &str = "order not found";
pub const UNKNOWN_ORDER_MESSAGE: &str = "Order does not exist";

/// Weight class of a request path.
pub fn classify(path: &str) -> WeightClass {
    match path {
        SEND_TX | SEND_TX_BATCH | NEXT_NONCE => WeightClass::Transaction,
        STATUS => WeightClass::Info,
        ORDER_BOOKS | TRADES => WeightClass::PublicData,
        ACCOUNT | ACTIVE_ORDERS | POSITIONS | FUNDING => WeightClass::AccountData,
        _ => WeightClass::Default,
    }
}
