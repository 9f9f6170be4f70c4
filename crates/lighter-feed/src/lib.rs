//! Order book stream for Lighter markets.
//!
//! Keeps one consistent book per market from a REST snapshot plus the
//! WebSocket diff channel, and republishes public trades.

pub mod book;
pub mod error;
pub mod parser;
pub mod source;
pub mod stream;
pub mod sync;

pub use book::{BookDiff, OrderBookState};
pub use error::{FeedError, FeedResult};
pub use parser::{parse_feed_message, FeedMessage, PublicTrade};
pub use source::{FakeSnapshotSource, SnapshotSource};
pub use stream::{spawn_book_stream, BookEvent, BookStreamHandle};
pub use sync::{BookSynchronizer, DiffOutcome};
