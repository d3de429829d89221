// Connector Seams - negotiation, streaming transport, baseline and alert store
// Boxed-future traits so the engine can hold `Arc<dyn ...>` collaborators

use futures::future::BoxFuture;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::errors::{BaselineFetchError, NegotiationError, PersistenceError, SessionError};
use crate::core::types::{AlertRule, BaselineEntry, Symbol};

/// Result of the negotiation phase. The token is opaque and single-use.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub url: String,
    pub access_token: String,
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("url", &self.url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// A live streaming session as a pair of channels.
///
/// `inbound` yields one hub record per item and closes when the transport is
/// lost; `outbound` accepts complete, framed records.
pub struct FeedSession {
    pub inbound: mpsc::UnboundedReceiver<String>,
    pub outbound: mpsc::UnboundedSender<String>,
    transport_task: Option<JoinHandle<()>>,
}

impl FeedSession {
    pub fn from_channels(
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            transport_task: None,
        }
    }

    pub fn with_transport_task(mut self, task: JoinHandle<()>) -> Self {
        self.transport_task = Some(task);
        self
    }

    /// Queue one framed record; false once the transport is gone
    pub fn send(&self, record: String) -> bool {
        self.outbound.send(record).is_ok()
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        if let Some(task) = self.transport_task.take() {
            task.abort();
        }
    }
}

/// Two-phase access to the push feed
pub trait FeedConnector: Send + Sync {
    fn negotiate(&self) -> BoxFuture<'_, Result<SessionDescriptor, NegotiationError>>;

    fn open<'a>(
        &'a self,
        descriptor: &'a SessionDescriptor,
    ) -> BoxFuture<'a, Result<FeedSession, SessionError>>;
}

/// Reference ("previous close") price lookup
pub trait BaselineSource: Send + Sync {
    fn fetch_reference_prices<'a>(
        &'a self,
        symbols: &'a [Symbol],
    ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>>;
}

/// Durable alert records owned by an external service
pub trait AlertStore: Send + Sync {
    fn load_rules(&self) -> BoxFuture<'_, Result<Vec<AlertRule>, PersistenceError>>;

    fn mark_triggered<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_debug_redacts_token() {
        let d = SessionDescriptor {
            url: "https://feed.example/client".to_string(),
            access_token: "super-secret".to_string(),
        };
        let printed = format!("{:?}", d);
        assert!(printed.contains("feed.example"));
        assert!(!printed.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_session_send_after_peer_dropped() {
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = FeedSession::from_channels(in_rx, out_tx);

        assert!(session.send("hello".to_string()));
        drop(out_rx);
        assert!(!session.send("again".to_string()));
    }
}
