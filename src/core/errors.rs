// Error Taxonomy for the Quote & Alert Engine
// One enum per failure class; only negotiation/session failures reach callers

use thiserror::Error;

use crate::core::config::ConfigError;
use crate::core::types::Symbol;

/// Session descriptor could not be obtained
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Negotiation rejected with status {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("Negotiation response missing field: {0}")]
    MissingField(&'static str),
    #[error("Cancelled")]
    Cancelled,
}

/// Streaming transport could not be established or was lost
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid session URL: {0}")]
    InvalidUrl(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out after {0}s")]
    Timeout(u64),
    #[error("Session is closed")]
    Closed,
    #[error("Connection already {0}")]
    InvalidState(crate::core::types::ConnectionState),
}

/// Per-symbol subscribe failure; never fatal to the session
#[derive(Debug, Clone, Error)]
#[error("Subscribe failed for {symbol}: {message}")]
pub struct SubscribeError {
    pub symbol: Symbol,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum BaselineFetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a best-effort alert persistence side effect
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("Alert store not configured")]
    NotConfigured,
}

/// Errors surfaced to the owner of the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Live data unavailable: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Live data unavailable: {0}")]
    Session(#[from] SessionError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Alert store error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}
