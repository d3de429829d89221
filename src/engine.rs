// Quote & Alert Engine - one explicit instance wiring feed, baselines, board and alerts
// ConnectionManager -> FeedEvent channel -> single worker -> board + alerts + event bus

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, PersistenceError};
use crate::core::events::{EngineEvent, Event, EventBus};
use crate::core::types::{
    resolve_target, AlertDirection, AlertRule, ConnectionState, DisplayQuote, Filing, RawQuote, Symbol,
};
use crate::layer1::connector::{AlertStore, BaselineSource, FeedConnector};
use crate::layer1::rest_client::FeedRestClient;
use crate::layer1::websocket::SignalRConnector;
use crate::layer2::baseline_store::{BaselineStore, RefreshOutcome};
use crate::layer2::connection::{ConnectionManager, FeedEvent};
use crate::layer2::quote_processor::process_batch;
use crate::layer2::subscription::SubscriptionTracker;
use crate::layer2::watchlist::{DisplayBoard, Watchlist, WatchlistRow};
use crate::layer3::alert_engine::AlertEngine;
use crate::layer3::notifications::NotificationSink;

pub type QuoteBatchHandler = Arc<dyn Fn(&[RawQuote]) + Send + Sync>;
pub type FilingHandler = Arc<dyn Fn(&Filing) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    quotes: Vec<QuoteBatchHandler>,
    filings: Vec<FilingHandler>,
}

#[derive(Debug, Default)]
struct WorkerStats {
    batches: AtomicU64,
    batches_skipped: AtomicU64,
    display_updates: AtomicU64,
    discarded_ticks: AtomicU64,
    filings: AtomicU64,
    alerts_fired: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub state: ConnectionState,
    pub batches: u64,
    pub batches_skipped: u64,
    pub display_updates: u64,
    pub discarded_ticks: u64,
    pub filings: u64,
    pub alerts_fired: u64,
    pub watched_symbols: usize,
    pub notifications: usize,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Engine(state={}, batches={}, skipped={}, updates={}, discarded={}, filings={}, alerts={}, watched={})",
            self.state, self.batches, self.batches_skipped, self.display_updates,
            self.discarded_ticks, self.filings, self.alerts_fired, self.watched_symbols
        )
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Everything the single delivery worker touches
#[derive(Clone)]
struct WorkerContext {
    board: Arc<DisplayBoard>,
    baselines: Arc<BaselineStore>,
    alerts: Arc<AlertEngine>,
    events: Arc<EventBus>,
    handlers: Arc<RwLock<Handlers>>,
    stats: Arc<WorkerStats>,
}

impl WorkerContext {
    fn on_quotes(&self, batch: &[RawQuote]) {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        let handlers = self.handlers.read().quotes.clone();
        for handler in &handlers {
            handler(batch);
        }

        let board = self.board.snapshot();
        let processed = process_batch(batch, &self.baselines.snapshot(), &board.membership, &board.quotes);
        let applied = self.board.apply(&processed.updates);

        self.stats.display_updates.fetch_add(applied as u64, Ordering::Relaxed);
        self.stats.discarded_ticks.fetch_add(processed.discarded as u64, Ordering::Relaxed);
        for update in processed.updates {
            self.events.publish(EngineEvent::QuoteUpdated(update));
        }

        // Alerts see the raw batch, watched or not
        for trigger in self.alerts.evaluate(batch) {
            self.stats.alerts_fired.fetch_add(1, Ordering::Relaxed);
            self.events.publish(EngineEvent::AlertTriggered(trigger));
        }
    }

    fn on_filing(&self, filing: Filing) {
        self.stats.filings.fetch_add(1, Ordering::Relaxed);

        let handlers = self.handlers.read().filings.clone();
        for handler in &handlers {
            handler(&filing);
        }
        self.events.publish(EngineEvent::Filing(filing));
    }

    async fn run(self, mut feed: mpsc::UnboundedReceiver<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        debug!("Quote worker started");
        let mut state = ConnectionState::Idle;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                event = feed.recv() => {
                    match event {
                        Some(FeedEvent::Quotes(batch)) => {
                            if state == ConnectionState::Connected {
                                self.on_quotes(&batch);
                            } else {
                                self.stats.batches_skipped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Some(FeedEvent::Filing(filing)) => {
                            if state == ConnectionState::Connected {
                                self.on_filing(filing);
                            }
                        }
                        Some(FeedEvent::StateChanged(next)) => {
                            state = next;
                            self.events.publish(EngineEvent::ConnectionChanged(next));
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("Quote worker stopped");
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Real-time quote display and price-alert engine
///
/// Features:
/// - Single push-feed session with automatic reconnect and resubscribe
/// - Multiple watch-lists sharing one subscription set and baseline map
/// - Percent change against the previous close, formatted for display
/// - Directional alerts that fire at most once per rule
/// - Typed events for presentation layers via the `EventBus`
pub struct QuoteAlertEngine {
    config: EngineConfig,

    connection: ConnectionManager,
    baseline_source: Arc<dyn BaselineSource>,

    context: WorkerContext,
    notifications: Arc<NotificationSink>,

    feed_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
    /// Serializes watch-list updates end to end (board, subscriptions, baselines)
    watchlist_update: Mutex<()>,
    /// Desired-set read and tracker write happen as one step
    reconcile_lock: parking_lot::Mutex<()>,
    worker_shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QuoteAlertEngine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn FeedConnector>,
        baseline_source: Arc<dyn BaselineSource>,
        alert_store: Option<Arc<dyn AlertStore>>,
    ) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(SubscriptionTracker::new());
        let connection = ConnectionManager::new(connector, config.feed.clone(), tracker, feed_tx);

        let notifications = Arc::new(NotificationSink::new());
        let context = WorkerContext {
            board: Arc::new(DisplayBoard::new()),
            baselines: Arc::new(BaselineStore::new()),
            alerts: Arc::new(AlertEngine::new(Arc::clone(&notifications), alert_store)),
            events: Arc::new(EventBus::new(config.monitoring.event_history)),
            handlers: Arc::new(RwLock::new(Handlers::default())),
            stats: Arc::new(WorkerStats::default()),
        };
        let (worker_shutdown, _) = watch::channel(false);

        info!("Quote alert engine created");

        Self {
            config,
            connection,
            baseline_source,
            context,
            notifications,
            feed_rx: parking_lot::Mutex::new(Some(feed_rx)),
            watchlist_update: Mutex::new(()),
            reconcile_lock: parking_lot::Mutex::new(()),
            worker_shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Production wiring: REST backend plus the SignalR transport
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let rest = Arc::new(FeedRestClient::from_config(&config)?);
        let connector: Arc<dyn FeedConnector> = Arc::new(SignalRConnector::from_config(Arc::clone(&rest), &config));
        let alert_store: Option<Arc<dyn AlertStore>> = if config.alerts.alerts_url.is_empty() {
            None
        } else {
            Some(rest.clone())
        };

        Ok(Self::new(config, connector, rest, alert_store))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn ensure_worker(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() || *self.worker_shutdown.borrow() {
            return;
        }
        if let Some(feed) = self.feed_rx.lock().take() {
            let shutdown = self.worker_shutdown.subscribe();
            *worker = Some(tokio::spawn(self.context.clone().run(feed, shutdown)));
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect the live feed. Initial failures are returned; the engine stays
    /// usable offline and `connect` may be retried.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.ensure_worker().await;
        self.connection.connect().await
    }

    /// Tear everything down. No handler runs after this returns.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.context.baselines.close();

        self.worker_shutdown.send_replace(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Quote worker failed");
            }
        }

        self.context.events.publish(EngineEvent::ConnectionChanged(ConnectionState::Closed));
        info!("Quote alert engine stopped");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    // ------------------------------------------------------------------------
    // Watch-lists
    // ------------------------------------------------------------------------

    /// Replace the open watch-lists: updates the board, subscribes new symbols
    /// and refreshes baselines for the whole union
    pub async fn update_watchlists(&self, watchlists: Vec<Watchlist>) -> RefreshOutcome {
        let _guard = self.watchlist_update.lock().await;

        let membership = self.context.board.set_watchlists(watchlists);
        let subscribed = self.resubscribe();

        let mut symbols: Vec<Symbol> = membership.into_iter().collect();
        symbols.sort();
        debug!(symbols = symbols.len(), new_subscriptions = subscribed, "Watch-lists updated");

        self.context
            .baselines
            .refresh(self.baseline_source.as_ref(), &symbols)
            .await
    }

    /// Feed needs: every watched symbol plus every symbol with an armed alert
    fn resubscribe(&self) -> usize {
        let _guard = self.reconcile_lock.lock();
        let mut desired = self.context.board.membership();
        desired.extend(self.context.alerts.armed_symbols());
        self.connection.reconcile(&desired)
    }

    pub fn watched_symbols(&self) -> HashSet<Symbol> {
        self.context.board.membership()
    }

    pub fn watchlist_view(&self, name: &str) -> Option<Vec<WatchlistRow>> {
        self.context.board.rows(name)
    }

    pub fn display_quote(&self, symbol: &str) -> Option<DisplayQuote> {
        self.context.board.quote(symbol)
    }

    pub fn reference_price(&self, symbol: &str) -> Option<f64> {
        self.context.baselines.get(symbol)
    }

    // ------------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------------

    /// Create a rule from user input; `target` may be absolute or `+N`/`-N`
    /// relative to the symbol's last price
    pub fn add_alert(&self, symbol: &str, target: &str, direction: AlertDirection, note: &str) -> Option<AlertRule> {
        let symbol = Symbol::new(symbol);
        if symbol.is_empty() {
            return None;
        }
        let target_price = resolve_target(target, self.context.alerts.last_price(symbol.as_str()))?;

        let rule = AlertRule::new(&Uuid::new_v4().to_string(), symbol.as_str(), target_price, direction)
            .with_note(note);
        self.add_alert_rule(rule.clone()).then_some(rule)
    }

    pub fn add_alert_rule(&self, rule: AlertRule) -> bool {
        if !self.context.alerts.add_rule(rule) {
            return false;
        }
        self.resubscribe();
        true
    }

    pub fn remove_alert(&self, id: &str) -> Option<AlertRule> {
        self.context.alerts.remove_rule(id)
    }

    pub fn alerts(&self) -> Vec<AlertRule> {
        self.context.alerts.rules()
    }

    pub async fn load_alerts(&self) -> Result<usize, PersistenceError> {
        let loaded = self.context.alerts.load_from_store().await?;
        self.resubscribe();
        Ok(loaded)
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.list()
    }

    pub fn dismiss_notification(&self, index: usize) -> Option<String> {
        self.notifications.dismiss(index)
    }

    pub fn clear_notifications(&self) {
        self.notifications.clear();
    }

    // ------------------------------------------------------------------------
    // Handlers & events
    // ------------------------------------------------------------------------

    /// Invoked by the worker for every batch delivered while connected
    pub fn on_quote_batch<F>(&self, handler: F)
    where
        F: Fn(&[RawQuote]) + Send + Sync + 'static,
    {
        self.context.handlers.write().quotes.push(Arc::new(handler));
    }

    pub fn on_filing_event<F>(&self, handler: F)
    where
        F: Fn(&Filing) + Send + Sync + 'static,
    {
        self.context.handlers.write().filings.push(Arc::new(handler));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.context.events.subscribe_channel()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.context.events)
    }

    pub fn get_stats(&self) -> EngineStats {
        let s = &self.context.stats;
        EngineStats {
            state: self.connection.state(),
            batches: s.batches.load(Ordering::Relaxed),
            batches_skipped: s.batches_skipped.load(Ordering::Relaxed),
            display_updates: s.display_updates.load(Ordering::Relaxed),
            discarded_ticks: s.discarded_ticks.load(Ordering::Relaxed),
            filings: s.filings.load(Ordering::Relaxed),
            alerts_fired: s.alerts_fired.load(Ordering::Relaxed),
            watched_symbols: self.context.board.membership().len(),
            notifications: self.notifications.len(),
        }
    }
}
