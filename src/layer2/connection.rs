// Connection Manager - the single push-feed session
// Negotiate -> open -> subscribe, automatic reconnect with backoff, cancellable teardown

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::FeedConfig;
use crate::core::errors::{EngineError, NegotiationError, SessionError, SubscribeError};
use crate::core::types::{ConnectionState, Filing, RawQuote, Symbol};
use crate::layer1::connector::{FeedConnector, FeedSession};
use crate::layer2::parser::{create_subscribe_message, MessageParser, ParsedMessage};
use crate::layer2::subscription::SubscriptionTracker;

/// Everything the feed delivers to the engine worker, in order
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Quotes(Vec<RawQuote>),
    Filing(Filing),
    StateChanged(ConnectionState),
}

#[derive(Debug)]
enum SessionCommand {
    Subscribe(Vec<Symbol>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    TransportLost,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub messages_received: u64,
    pub parse_errors: u64,
    pub sessions_opened: u64,
    pub reconnect_attempts: u64,
    pub subscribe_requests: u64,
    pub subscribe_failures: u64,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection(state={}, messages={}, errors={}, sessions={}, reconnects={}, subs={}, sub_failures={})",
            self.state, self.messages_received, self.parse_errors, self.sessions_opened,
            self.reconnect_attempts, self.subscribe_requests, self.subscribe_failures
        )
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State visible to both the manager handle and the feed loop task
struct Shared {
    state: RwLock<ConnectionState>,
    events: mpsc::UnboundedSender<FeedEvent>,
    tracker: Arc<SubscriptionTracker>,

    messages_received: AtomicU64,
    parse_errors: AtomicU64,
    sessions_opened: AtomicU64,
    reconnect_attempts: AtomicU64,
    subscribe_requests: AtomicU64,
    subscribe_failures: AtomicU64,
}

impl Shared {
    /// Closed is terminal: later transitions are refused
    fn set_state(&self, next: ConnectionState) -> bool {
        {
            let mut state = self.state.write();
            if *state == next || state.is_terminal() {
                return false;
            }
            let prev = *state;
            debug!(from = %prev, to = %next, "Connection state change");
            *state = next;
        }
        let _ = self.events.send(FeedEvent::StateChanged(next));
        true
    }

    fn emit(&self, event: FeedEvent) {
        let _ = self.events.send(event);
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Owns the feed session lifecycle
///
/// Features:
/// - Two-phase connect (negotiate, then open) surfaced to the caller
/// - Automatic reconnect with exponential backoff and a fresh token per attempt
/// - Full resubscribe of the active set on every new session
/// - Per-symbol subscribe failures isolated and retried on next reconcile
pub struct ConnectionManager {
    connector: Arc<dyn FeedConnector>,
    config: FeedConfig,
    shared: Arc<Shared>,

    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SessionCommand>>>,

    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        config: FeedConfig,
        tracker: Arc<SubscriptionTracker>,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Idle),
                events,
                tracker,
                messages_received: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
                sessions_opened: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
                subscribe_requests: AtomicU64::new(0),
                subscribe_failures: AtomicU64::new(0),
            }),
            commands_tx,
            commands_rx: parking_lot::Mutex::new(Some(commands_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Claim the Idle -> Negotiating edge so only one connect runs
    fn begin_connect(&self) -> Result<(), SessionError> {
        {
            let mut state = self.shared.state.write();
            if *state != ConnectionState::Idle {
                return Err(SessionError::InvalidState(*state));
            }
            *state = ConnectionState::Negotiating;
        }
        self.shared.emit(FeedEvent::StateChanged(ConnectionState::Negotiating));
        Ok(())
    }

    async fn establish(&self) -> Result<FeedSession, EngineError> {
        let descriptor = self.connector.negotiate().await?;
        self.shared.set_state(ConnectionState::Connecting);
        let session = self.connector.open(&descriptor).await?;
        Ok(session)
    }

    /// Open the live session. Failures are returned and leave the manager Idle
    /// so the caller may retry.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.begin_connect()?;
        info!("Connecting to quote feed");

        let mut shutdown = self.shutdown_tx.subscribe();
        let result = tokio::select! {
            result = self.establish() => result,
            _ = wait_shutdown(&mut shutdown) => Err(NegotiationError::Cancelled.into()),
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Feed connect failed");
                self.shared.set_state(ConnectionState::Idle);
                return Err(e);
            }
        };

        // Held across the shutdown check so disconnect() either sees the task or cancels us
        let mut task = self.task.lock().await;
        if *self.shutdown_tx.borrow() {
            return Err(NegotiationError::Cancelled.into());
        }

        let Some(commands) = self.commands_rx.lock().take() else {
            self.shared.set_state(ConnectionState::Idle);
            return Err(SessionError::InvalidState(self.state()).into());
        };

        let mut feed_loop = FeedLoop {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            commands,
            shutdown,
            parser: MessageParser::new(),
            pending: HashMap::new(),
            next_invocation_id: 0,
        };
        feed_loop.start_session(&session);

        *task = Some(tokio::spawn(feed_loop.run(session)));
        info!("Quote feed connected");
        Ok(())
    }

    /// Record the desired symbol set and subscribe whatever is new on the live session
    pub fn reconcile(&self, active: &HashSet<Symbol>) -> usize {
        let fresh = self.shared.tracker.reconcile(active);
        let count = fresh.len();
        if count > 0 && self.commands_tx.send(SessionCommand::Subscribe(fresh)).is_err() {
            warn!("Feed loop gone, subscribe dropped");
        }
        count
    }

    /// Release the session and wait for the feed loop to finish. Terminal.
    pub async fn disconnect(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Feed loop panicked");
                }
            }
        }

        self.shared.tracker.end_session();
        self.shared.set_state(ConnectionState::Closed);
        info!("Quote feed disconnected");
    }

    pub fn get_stats(&self) -> ConnectionStats {
        let s = &self.shared;
        ConnectionStats {
            state: self.state(),
            messages_received: s.messages_received.load(Ordering::Relaxed),
            parse_errors: s.parse_errors.load(Ordering::Relaxed),
            sessions_opened: s.sessions_opened.load(Ordering::Relaxed),
            reconnect_attempts: s.reconnect_attempts.load(Ordering::Relaxed),
            subscribe_requests: s.subscribe_requests.load(Ordering::Relaxed),
            subscribe_failures: s.subscribe_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Feed Loop
// ============================================================================

struct FeedLoop {
    connector: Arc<dyn FeedConnector>,
    config: FeedConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
    parser: MessageParser,
    /// Outstanding SubL1 invocations by id
    pending: HashMap<String, Symbol>,
    next_invocation_id: u32,
}

impl FeedLoop {
    async fn run(mut self, mut session: FeedSession) {
        loop {
            let exit = self.drive(&mut session).await;
            drop(session);
            self.shared.tracker.end_session();
            self.pending.clear();

            if exit == LoopExit::Shutdown {
                break;
            }

            session = match self.reconnect().await {
                Some(session) => session,
                None => break,
            };
        }
        debug!(stats = %self.parser.get_stats(), "Feed loop stopped");
    }

    /// Commands queued for an earlier session are superseded by the full resubscribe
    fn start_session(&mut self, session: &FeedSession) {
        while self.commands.try_recv().is_ok() {}
        self.pending.clear();

        let symbols = self.shared.tracker.begin_session();
        self.shared.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Connected);

        info!(symbols = symbols.len(), "Feed session live, subscribing");
        self.subscribe(session, symbols);
    }

    fn subscribe(&mut self, session: &FeedSession, symbols: Vec<Symbol>) {
        for symbol in symbols {
            self.next_invocation_id = self.next_invocation_id.wrapping_add(1);
            let id = self.next_invocation_id;

            if !session.send(create_subscribe_message(id, &symbol)) {
                debug!("Transport gone while subscribing");
                return;
            }
            self.shared.subscribe_requests.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %symbol, invocation_id = id, "Subscribe sent");
            self.pending.insert(id.to_string(), symbol);
        }
    }

    async fn drive(&mut self, session: &mut FeedSession) -> LoopExit {
        loop {
            tokio::select! {
                biased;

                _ = wait_shutdown(&mut self.shutdown) => return LoopExit::Shutdown,

                record = session.inbound.recv() => {
                    match record {
                        Some(record) => {
                            if !self.handle_record(&record) {
                                return LoopExit::TransportLost;
                            }
                        }
                        None => {
                            warn!("Feed transport lost");
                            return LoopExit::TransportLost;
                        }
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Subscribe(symbols)) => self.subscribe(session, symbols),
                        // Manager dropped without disconnect()
                        None => return LoopExit::Shutdown,
                    }
                }
            }
        }
    }

    /// Returns false when the server closed the session
    fn handle_record(&mut self, record: &str) -> bool {
        self.shared.messages_received.fetch_add(1, Ordering::Relaxed);

        match self.parser.parse(record) {
            Ok(ParsedMessage::Quotes(quotes)) => {
                if !quotes.is_empty() {
                    self.shared.emit(FeedEvent::Quotes(quotes));
                }
            }
            Ok(ParsedMessage::Filing(filing)) => self.shared.emit(FeedEvent::Filing(filing)),
            Ok(ParsedMessage::Completion { invocation_id, error }) => {
                self.on_completion(&invocation_id, error);
            }
            Ok(ParsedMessage::Ping) | Ok(ParsedMessage::Ignored(_)) => {}
            Ok(ParsedMessage::Close { error }) => {
                warn!(error = ?error, "Feed session closed by hub");
                return false;
            }
            Err(_) => {
                self.shared.parse_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    fn on_completion(&mut self, invocation_id: &str, error: Option<String>) {
        let Some(symbol) = self.pending.remove(invocation_id) else {
            return;
        };

        match error {
            Some(message) => {
                let err = SubscribeError { symbol, message };
                warn!(error = %err, "Subscribe rejected");
                self.shared.tracker.forget(&err.symbol);
                self.shared.subscribe_failures.fetch_add(1, Ordering::Relaxed);
            }
            None => debug!(symbol = %symbol, "Subscribe acknowledged"),
        }
    }

    /// Backoff, re-negotiate and reopen until success, shutdown or exhaustion
    async fn reconnect(&mut self) -> Option<FeedSession> {
        self.shared.set_state(ConnectionState::Reconnecting);

        for attempt in 0..self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_delay(attempt);
            info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting to quote feed");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_shutdown(&mut self.shutdown) => return None,
            }

            self.shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            let result = tokio::select! {
                result = reopen(self.connector.as_ref()) => result,
                _ = wait_shutdown(&mut self.shutdown) => return None,
            };

            match result {
                Ok(session) => {
                    info!(attempt = attempt + 1, "Quote feed reconnected");
                    self.start_session(&session);
                    return Some(session);
                }
                Err(e) => warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed"),
            }
        }

        error!(
            attempts = self.config.max_reconnect_attempts,
            "Reconnect attempts exhausted, closing feed"
        );
        self.shared.set_state(ConnectionState::Closed);
        None
    }
}

/// Fresh token every time; descriptors are never reused
async fn reopen(connector: &dyn FeedConnector) -> Result<FeedSession, EngineError> {
    let descriptor = connector.negotiate().await?;
    Ok(connector.open(&descriptor).await?)
}
