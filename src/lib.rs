// Quote Alert Engine - real-time watch-list quotes and price alerts
// Layered: core (types/config/logging/events) -> layer1 (connectors)
//          -> layer2 (session + processing) -> layer3 (alerts) -> engine

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
pub mod engine;

pub use engine::{EngineStats, QuoteAlertEngine};
