// Layer 2 - Feed Session & Quote Processing
// Parses hub records, owns the session lifecycle and turns ticks into display state

pub mod parser;
pub mod subscription;
pub mod connection;
pub mod baseline_store;
pub mod quote_processor;
pub mod watchlist;

// Re-export commonly used items
pub use parser::{MessageParser, ParsedMessage, ParseError, ParserStats, create_subscribe_message};
pub use subscription::{SubscriptionTracker, SubscriptionStats};
pub use connection::{ConnectionManager, ConnectionStats, FeedEvent};
pub use baseline_store::{BaselineMap, BaselineStore, BaselineStoreStats, RefreshOutcome};
pub use quote_processor::{process_batch, format_percent_change, format_price, ProcessedBatch};
pub use watchlist::{BoardSnapshot, DisplayBoard, Watchlist, WatchlistRow};
