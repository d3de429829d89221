// Core Module - Foundational types, config, logging, events, errors

pub mod types;
pub mod config;
pub mod logger;
pub mod events;
pub mod errors;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    FeedConfig, BaselineConfig, AlertStoreConfig, MonitoringConfig, EngineConfig,
    ConfigManager, ConfigSummary, ConfigError,
};
pub use logger::{setup_logging, setup_logging_from_config};
pub use events::{Event, EngineEvent, EventBus, EventBusStatsSnapshot};
pub use errors::{
    NegotiationError, SessionError, SubscribeError, BaselineFetchError,
    PersistenceError, EngineError,
};
