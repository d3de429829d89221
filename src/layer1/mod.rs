// Layer 1 - Data Connectors for the push feed and its REST backend

pub mod connector;
pub mod rest_client;
pub mod websocket;

// Re-export commonly used items for convenience
pub use connector::{AlertStore, BaselineSource, FeedConnector, FeedSession, SessionDescriptor};
pub use rest_client::{FeedRestClient, RestClientStats};
pub use websocket::{SignalRConnector, RECORD_SEPARATOR};
