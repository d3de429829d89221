// Layer 3 - Alerting
// Price-alert evaluation over raw ticks and the user-facing notification queue

pub mod alert_engine;
pub mod notifications;

pub use alert_engine::{AlertEngine, AlertEngineStats};
pub use notifications::NotificationSink;
