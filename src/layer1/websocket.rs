// WebSocket Transport - SignalR JSON hub protocol over tokio-tungstenite
// Bridges one live socket to a `FeedSession` channel pair with ping + stale detection

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{NegotiationError, SessionError};
use crate::layer1::connector::{FeedConnector, FeedSession, SessionDescriptor};
use crate::layer1::rest_client::FeedRestClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ============================================================================
// Hub Protocol Framing
// ============================================================================

/// Terminates every JSON hub record
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub fn handshake_request() -> String {
    format!("{}{}", serde_json::json!({"protocol": "json", "version": 1}), RECORD_SEPARATOR)
}

pub fn create_ping_message() -> String {
    format!("{}{}", serde_json::json!({"type": 6}), RECORD_SEPARATOR)
}

/// Framed non-streaming invocation that expects a completion
pub fn create_invocation_message(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    let msg = serde_json::json!({
        "type": 1,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    });
    format!("{}{}", msg, RECORD_SEPARATOR)
}

/// Split one text frame into its non-empty records
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

/// Streaming URL for a negotiated descriptor: `http(s)` becomes `ws(s)` and
/// the token travels as `access_token`
pub fn build_session_url(descriptor: &SessionDescriptor) -> Result<Url, SessionError> {
    let mut url = Url::parse(&descriptor.url)
        .map_err(|e| SessionError::InvalidUrl(format!("{}: {}", descriptor.url, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(SessionError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::InvalidUrl(descriptor.url.clone()))?;

    url.query_pairs_mut().append_pair("access_token", &descriptor.access_token);
    Ok(url)
}

// ============================================================================
// SignalR Connector
// ============================================================================

/// Production `FeedConnector`: REST negotiation plus a SignalR WebSocket session
pub struct SignalRConnector {
    rest: Arc<FeedRestClient>,
    ping_interval_secs: u64,
    stale_timeout_secs: u64,
    handshake_timeout_secs: u64,
}

impl SignalRConnector {
    pub fn new(
        rest: Arc<FeedRestClient>,
        ping_interval_secs: u64,
        stale_timeout_secs: u64,
        handshake_timeout_secs: u64,
    ) -> Self {
        Self {
            rest,
            ping_interval_secs,
            stale_timeout_secs,
            handshake_timeout_secs,
        }
    }

    pub fn from_config(rest: Arc<FeedRestClient>, config: &EngineConfig) -> Self {
        Self::new(
            rest,
            config.feed.ping_interval_secs,
            config.feed.stale_timeout_secs,
            config.feed.handshake_timeout_secs,
        )
    }

    async fn open_session(&self, descriptor: &SessionDescriptor) -> Result<FeedSession, SessionError> {
        let url = build_session_url(descriptor)?;
        let timeout = Duration::from_secs(self.handshake_timeout_secs);

        debug!(host = ?url.host_str(), "Opening feed session");

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SessionError::Timeout(self.handshake_timeout_secs))??;

        let (mut write, mut read) = ws_stream.split();
        write.send(Message::Text(handshake_request())).await?;

        let leftover = tokio::time::timeout(timeout, await_handshake(&mut read))
            .await
            .map_err(|_| SessionError::Timeout(self.handshake_timeout_secs))??;

        info!("Feed session established");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();

        for record in leftover {
            let _ = inbound_tx.send(record);
        }

        let task = tokio::spawn(run_transport(
            write,
            read,
            inbound_tx,
            outbound_rx,
            self.ping_interval_secs,
            self.stale_timeout_secs,
        ));

        Ok(FeedSession::from_channels(inbound_rx, outbound_tx).with_transport_task(task))
    }
}

impl FeedConnector for SignalRConnector {
    fn negotiate(&self) -> BoxFuture<'_, Result<SessionDescriptor, NegotiationError>> {
        self.rest.negotiate().boxed()
    }

    fn open<'a>(
        &'a self,
        descriptor: &'a SessionDescriptor,
    ) -> BoxFuture<'a, Result<FeedSession, SessionError>> {
        self.open_session(descriptor).boxed()
    }
}

/// Wait for the handshake response; returns records that arrived in the same frame
async fn await_handshake(read: &mut WsRead) -> Result<Vec<String>, SessionError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = split_records(&text);
                let Some(first) = records.next() else {
                    continue;
                };

                let response: Value = serde_json::from_str(first)
                    .map_err(|e| SessionError::Handshake(format!("invalid response: {}", e)))?;
                if let Some(err) = response.get("error").and_then(|e| e.as_str()) {
                    return Err(SessionError::Handshake(err.to_string()));
                }

                return Ok(records.map(|r| r.to_string()).collect());
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SessionError::Handshake("closed during handshake".to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(SessionError::WebSocket(e)),
        }
    }
}

/// Pump one socket until it is lost, goes stale, or the session owner drops it.
/// Dropping `inbound` on exit is how the owner learns the transport is gone.
async fn run_transport(
    mut write: WsWrite,
    mut read: WsRead,
    inbound: mpsc::UnboundedSender<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    ping_interval_secs: u64,
    stale_timeout_secs: u64,
) {
    let stale_timeout = Duration::from_secs(stale_timeout_secs);
    let mut ping = tokio::time::interval(Duration::from_secs(ping_interval_secs.max(1)));
    let mut health = tokio::time::interval(Duration::from_secs((stale_timeout_secs / 2).max(1)));
    let mut last_message_time = Instant::now();

    // Both intervals fire immediately on first tick
    ping.tick().await;
    health.tick().await;

    loop {
        tokio::select! {
            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        last_message_time = Instant::now();
                        for record in split_records(&text) {
                            if inbound.send(record.to_string()).is_err() {
                                debug!("Session owner gone, stopping transport");
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_message_time = Instant::now();
                        warn!(bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_message_time = Instant::now();
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_message_time = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "Feed session closed by server");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Feed transport error");
                        break;
                    }
                    None => {
                        info!("Feed stream ended");
                        break;
                    }
                }
            }

            record = outbound.recv() => {
                match record {
                    Some(record) => {
                        if let Err(e) = write.send(Message::Text(record)).await {
                            error!(error = %e, "Failed to send on feed session");
                            break;
                        }
                    }
                    None => {
                        debug!("Outbound channel closed");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text(create_ping_message())).await {
                    warn!(error = %e, "Ping failed");
                    break;
                }
            }

            _ = health.tick() => {
                let elapsed = last_message_time.elapsed();
                if elapsed > stale_timeout {
                    warn!(elapsed_secs = elapsed.as_secs(), "Stale feed session detected");
                    break;
                }
            }
        }
    }

    let _ = write.close().await;
    debug!("Feed transport stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(url: &str) -> SessionDescriptor {
        SessionDescriptor {
            url: url.to_string(),
            access_token: "abc.def".to_string(),
        }
    }

    #[test]
    fn test_handshake_request() {
        let msg = handshake_request();
        assert!(msg.ends_with(RECORD_SEPARATOR));
        assert!(msg.contains("\"protocol\":\"json\""));
        assert!(msg.contains("\"version\":1"));
    }

    #[test]
    fn test_invocation_message() {
        let msg = create_invocation_message("7", "SubL1", &[Value::from("AAPL")]);
        assert!(msg.ends_with(RECORD_SEPARATOR));
        let parsed: Value = serde_json::from_str(msg.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(parsed["type"], 1);
        assert_eq!(parsed["invocationId"], "7");
        assert_eq!(parsed["target"], "SubL1");
        assert_eq!(parsed["arguments"][0], "AAPL");
    }

    #[test]
    fn test_split_records() {
        let frame = format!("{{}}{sep}{{\"type\":6}}{sep}", sep = RECORD_SEPARATOR);
        let records: Vec<&str> = split_records(&frame).collect();
        assert_eq!(records, vec!["{}", "{\"type\":6}"]);
    }

    #[test]
    fn test_session_url_https_to_wss() {
        let url = build_session_url(&descriptor("https://hub.example/client/?hub=quotes")).unwrap();
        assert_eq!(url.scheme(), "wss");
        let query = url.query().unwrap();
        assert!(query.contains("hub=quotes"));
        assert!(query.contains("access_token=abc.def"));
    }

    #[test]
    fn test_session_url_http_to_ws() {
        let url = build_session_url(&descriptor("http://localhost:7071/client")).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_session_url_rejects_bad_input() {
        assert!(matches!(
            build_session_url(&descriptor("not a url")),
            Err(SessionError::InvalidUrl(_))
        ));
        assert!(matches!(
            build_session_url(&descriptor("ftp://hub.example")),
            Err(SessionError::InvalidUrl(_))
        ));
    }
}
