//! User stream for a Lighter account.
//!
//! Turns the private `orders`, `fills`, `positions` and `funding` channels
//! into deduplicated [`UserEvent`]s, and re-fetches open orders and recent
//! fills over REST whenever the stream (re)connects.

pub mod dedup;
pub mod error;
pub mod parser;
pub mod source;
pub mod stream;

pub use dedup::EventDeduplicator;
pub use error::{AccountError, AccountResult};
pub use parser::parse_user_message;
pub use source::{AccountSnapshot, AccountSource, FakeAccountSource};
pub use stream::{spawn_user_stream, UserEvent, UserStreamConfig, UserStreamHandle};
