// End-to-End Flow Tests for the Quote Alert Engine
//
// These tests drive the full engine without network connections:
//   in-memory feed connector -> ConnectionManager -> worker -> board + alerts + EventBus
//
// Run with: cargo test --test e2e_flow_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, Notify};

use quote_alert_engine::core::{
    AlertDirection, AlertRule, BaselineEntry, BaselineFetchError, ConnectionState, EngineConfig,
    EngineError, EngineEvent, NegotiationError, PersistenceError, SessionError, Symbol,
};
use quote_alert_engine::layer1::{
    AlertStore, BaselineSource, FeedConnector, FeedSession, SessionDescriptor, RECORD_SEPARATOR,
};
use quote_alert_engine::layer2::{RefreshOutcome, Watchlist};
use quote_alert_engine::QuoteAlertEngine;

// ============================================================================
// In-memory collaborators
// ============================================================================

/// Server side of one mock session. Dropping it simulates a transport loss.
struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    fn push(&self, record: String) {
        self.to_client.send(record).expect("client session gone");
    }

    /// Symbols of every SubL1 invocation received so far
    fn drain_subscribes(&mut self) -> Vec<String> {
        let mut symbols = Vec::new();
        while let Ok(raw) = self.from_client.try_recv() {
            let value: serde_json::Value =
                serde_json::from_str(raw.trim_end_matches(RECORD_SEPARATOR)).unwrap();
            if value["target"] == "SubL1" {
                symbols.push(value["arguments"][0].as_str().unwrap().to_string());
            }
        }
        symbols
    }
}

#[derive(Default)]
struct MockConnector {
    fail_next_negotiations: AtomicUsize,
    negotiations: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    servers: Mutex<Vec<ServerEnd>>,
}

impl FeedConnector for MockConnector {
    fn negotiate(&self) -> BoxFuture<'_, Result<SessionDescriptor, NegotiationError>> {
        async move {
            let n = self.negotiations.fetch_add(1, Ordering::SeqCst);
            if self.fail_next_negotiations.load(Ordering::SeqCst) > 0 {
                self.fail_next_negotiations.fetch_sub(1, Ordering::SeqCst);
                return Err(NegotiationError::Status { status: 503, reason: "Service Unavailable".to_string() });
            }
            Ok(SessionDescriptor {
                url: "https://feed.test/client/?hub=quotes".to_string(),
                access_token: format!("token-{}", n),
            })
        }
        .boxed()
    }

    fn open<'a>(&'a self, descriptor: &'a SessionDescriptor) -> BoxFuture<'a, Result<FeedSession, SessionError>> {
        async move {
            self.tokens.lock().unwrap().push(descriptor.access_token.clone());
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push(ServerEnd { to_client, from_client });
            Ok(FeedSession::from_channels(inbound, outbound))
        }
        .boxed()
    }
}

impl MockConnector {
    async fn next_server(&self) -> ServerEnd {
        for _ in 0..400 {
            {
                let mut servers = self.servers.lock().unwrap();
                if !servers.is_empty() {
                    return servers.remove(0);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no feed session was opened");
    }
}

#[derive(Default)]
struct MockBaselines {
    closes: Mutex<HashMap<String, f64>>,
    fetches: AtomicUsize,
}

impl MockBaselines {
    fn with(closes: &[(&str, f64)]) -> Self {
        let source = Self::default();
        for (symbol, close) in closes {
            source.closes.lock().unwrap().insert(symbol.to_string(), *close);
        }
        source
    }
}

impl BaselineSource for MockBaselines {
    fn fetch_reference_prices<'a>(
        &'a self,
        symbols: &'a [Symbol],
    ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>> {
        async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let closes = self.closes.lock().unwrap();
            Ok(symbols
                .iter()
                .filter_map(|s| {
                    closes.get(s.as_str()).map(|c| BaselineEntry { symbol: s.clone(), reference_price: *c })
                })
                .collect())
        }
        .boxed()
    }
}

/// Holds the first fetch until `release` is notified
#[derive(Default)]
struct GatedBaselines {
    inner: MockBaselines,
    release: Notify,
}

impl BaselineSource for GatedBaselines {
    fn fetch_reference_prices<'a>(
        &'a self,
        symbols: &'a [Symbol],
    ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>> {
        async move {
            if self.inner.fetches.load(Ordering::SeqCst) == 0 {
                self.release.notified().await;
            }
            self.inner.fetch_reference_prices(symbols).await
        }
        .boxed()
    }
}

#[derive(Default)]
struct MockAlertStore {
    rules: Vec<AlertRule>,
    marked: Mutex<Vec<String>>,
}

impl AlertStore for MockAlertStore {
    fn load_rules(&self) -> BoxFuture<'_, Result<Vec<AlertRule>, PersistenceError>> {
        async move { Ok(self.rules.clone()) }.boxed()
    }

    fn mark_triggered<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, Result<(), PersistenceError>> {
        async move {
            self.marked.lock().unwrap().push(rule_id.to_string());
            Ok(())
        }
        .boxed()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.feed.max_reconnect_attempts = 3;
    config.feed.reconnect_base_delay_ms = 1;
    config.feed.reconnect_max_delay_ms = 5;
    config
}

struct Harness {
    engine: QuoteAlertEngine,
    connector: Arc<MockConnector>,
    baselines: Arc<MockBaselines>,
    store: Arc<MockAlertStore>,
}

fn harness(closes: &[(&str, f64)]) -> Harness {
    let connector = Arc::new(MockConnector::default());
    let baselines = Arc::new(MockBaselines::with(closes));
    let store = Arc::new(MockAlertStore::default());
    let engine = QuoteAlertEngine::new(
        test_config(),
        connector.clone(),
        baselines.clone(),
        Some(store.clone()),
    );
    Harness { engine, connector, baselines, store }
}

fn quotes_record(ticks: &[(&str, f64)]) -> String {
    let entries: Vec<serde_json::Value> = ticks
        .iter()
        .map(|(s, l)| serde_json::json!({"s": s, "l": l}))
        .collect();
    serde_json::json!({"type": 1, "target": "BroadcastQuotes", "arguments": [entries]}).to_string()
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn last_price(engine: &QuoteAlertEngine, symbol: &str) -> Option<String> {
    engine.display_quote(symbol).map(|q| q.last_price)
}

// ============================================================================
// TEST 1 – Percent change against the previous close
// ============================================================================

#[tokio::test]
async fn test_percent_change_up_and_down() {
    let h = harness(&[("AAPL", 100.0)]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["aapl"])]).await;
    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;

    server.push(quotes_record(&[("AAPL", 105.0)]));
    wait_until("up tick", || last_price(&h.engine, "AAPL").as_deref() == Some("105.00")).await;
    assert_eq!(h.engine.display_quote("AAPL").unwrap().percent_change, "+5.00%");

    server.push(quotes_record(&[("aapl", 95.0)]));
    wait_until("down tick", || last_price(&h.engine, "AAPL").as_deref() == Some("95.00")).await;
    assert_eq!(h.engine.display_quote("AAPL").unwrap().percent_change, "-5.00%");

    h.engine.disconnect().await;
}

// ============================================================================
// TEST 2 – Missing baseline keeps the prior percent change
// ============================================================================

#[tokio::test]
async fn test_missing_baseline_keeps_prior_change() {
    let h = harness(&[("TSLA", 100.0)]);
    h.engine.update_watchlists(vec![Watchlist::new("EV", &["TSLA"])]).await;
    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;

    server.push(quotes_record(&[("TSLA", 110.0)]));
    wait_until("first tick", || last_price(&h.engine, "TSLA").as_deref() == Some("110.00")).await;
    assert_eq!(h.engine.display_quote("TSLA").unwrap().percent_change, "+10.00%");

    // Baseline disappears on the next refresh
    h.baselines.closes.lock().unwrap().clear();
    h.engine.update_watchlists(vec![Watchlist::new("EV", &["TSLA"])]).await;
    assert_eq!(h.engine.reference_price("TSLA"), None);

    server.push(quotes_record(&[("TSLA", 120.0)]));
    wait_until("second tick", || last_price(&h.engine, "TSLA").as_deref() == Some("120.00")).await;
    assert_eq!(h.engine.display_quote("TSLA").unwrap().percent_change, "+10.00%");

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_new_rows_start_as_placeholders() {
    let h = harness(&[]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["NVDA"])]).await;

    let row = &h.engine.watchlist_view("Main").unwrap()[0];
    assert_eq!(row.last_price, "0.00");
    assert_eq!(row.percent_change, "+0.00%");
}

// ============================================================================
// TEST 3 – Alerts trigger exactly once
// ============================================================================

#[tokio::test]
async fn test_alert_triggers_once() {
    let h = harness(&[]);
    let mut events = h.engine.subscribe_events();
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["SPY"])]).await;
    let rule = h.engine.add_alert("spy", "500", AlertDirection::Above, "breakout").unwrap();

    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;
    server.push(quotes_record(&[("SPY", 499.0)]));
    server.push(quotes_record(&[("SPY", 500.0)]));
    server.push(quotes_record(&[("SPY", 510.0), ("SPY", 520.0)]));

    wait_until("all batches", || h.engine.get_stats().batches == 3).await;
    assert_eq!(h.engine.notifications(), vec!["🔔 SPY is above 500.00".to_string()]);
    assert!(h.engine.alerts()[0].triggered);

    wait_until("persistence", || !h.store.marked.lock().unwrap().is_empty()).await;
    assert_eq!(*h.store.marked.lock().unwrap(), vec![rule.id.clone()]);

    let mut triggers = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::AlertTriggered(t) = event.payload {
            triggers.push(t);
        }
    }
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].price, 500.0);

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_direction_boundaries() {
    let h = harness(&[]);
    for (id, target, dir) in [
        ("above-50", 50.0, AlertDirection::Above),
        ("below-50", 50.0, AlertDirection::Below),
    ] {
        h.engine.add_alert_rule(AlertRule::new(id, "X", target, dir));
    }
    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;

    // 49.99 fires only the below rule; exactly 50 then fires the above rule
    server.push(quotes_record(&[("X", 49.99)]));
    wait_until("first batch", || h.engine.get_stats().batches == 1).await;
    let fired: Vec<bool> = h.engine.alerts().iter().map(|r| r.triggered).collect();
    assert_eq!(fired, vec![false, true]);

    server.push(quotes_record(&[("X", 50.0)]));
    wait_until("second batch", || h.engine.get_stats().batches == 2).await;
    assert!(h.engine.alerts().iter().all(|r| r.triggered));

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_relative_alert_target() {
    let h = harness(&[]);
    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;

    server.push(quotes_record(&[("AMD", 100.0)]));
    wait_until("price seen", || h.engine.get_stats().batches == 1).await;

    let rule = h.engine.add_alert("AMD", "+5", AlertDirection::Above, "").unwrap();
    assert_eq!(rule.target_price, 105.0);
    assert!(h.engine.add_alert("AMD", "abc", AlertDirection::Above, "").is_none());

    h.engine.disconnect().await;
}

// ============================================================================
// TEST 4 – Ticks outside every watch-list
// ============================================================================

#[tokio::test]
async fn test_unwatched_ticks_still_evaluated() {
    let h = harness(&[]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["AAPL"])]).await;
    h.engine.add_alert_rule(AlertRule::new("gme", "GME", 20.0, AlertDirection::Above));

    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;
    server.push(quotes_record(&[("GME", 25.0)]));

    wait_until("batch processed", || h.engine.get_stats().batches == 1).await;
    assert!(h.engine.display_quote("GME").is_none());
    assert_eq!(h.engine.get_stats().discarded_ticks, 1);
    assert_eq!(h.engine.notifications().len(), 1);

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_alert_on_unwatched_symbol_is_subscribed() {
    let h = harness(&[]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["AAPL"])]).await;
    h.engine.connect().await.unwrap();
    let mut server = h.connector.next_server().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.drain_subscribes(), vec!["AAPL"]);

    let rule = h.engine.add_alert("nflx", "500", AlertDirection::Above, "").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.drain_subscribes(), vec!["NFLX"]);

    server.push(quotes_record(&[("NFLX", 510.0)]));
    wait_until("alert fired", || h.engine.notifications().len() == 1).await;
    assert!(h.engine.display_quote("NFLX").is_none());
    assert!(h.engine.alerts().iter().any(|r| r.id == rule.id && r.triggered));

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_loaded_alert_symbols_subscribed_on_connect() {
    let connector = Arc::new(MockConnector::default());
    let store = Arc::new(MockAlertStore {
        rules: vec![AlertRule::new("s1", "amd", 200.0, AlertDirection::Above)],
        ..Default::default()
    });
    let engine = QuoteAlertEngine::new(test_config(), connector.clone(), Arc::new(MockBaselines::default()), Some(store));

    engine.load_alerts().await.unwrap();
    engine.update_watchlists(vec![Watchlist::new("Main", &["AAPL"])]).await;
    engine.connect().await.unwrap();

    let mut server = connector.next_server().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.drain_subscribes(), vec!["AAPL", "AMD"]);

    engine.disconnect().await;
}

// ============================================================================
// TEST 5 – Subscription de-duplication and reconnect
// ============================================================================

#[tokio::test]
async fn test_reconcile_twice_subscribes_once() {
    let h = harness(&[]);
    h.engine.connect().await.unwrap();
    let mut server = h.connector.next_server().await;

    let lists = vec![Watchlist::new("One", &["A", "B"]), Watchlist::new("Two", &["b"])];
    h.engine.update_watchlists(lists.clone()).await;
    h.engine.update_watchlists(lists).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut subscribed = server.drain_subscribes();
    subscribed.sort();
    assert_eq!(subscribed, vec!["A", "B"]);

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_resubscribes_with_fresh_token() {
    let h = harness(&[]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["AAPL", "MSFT", "NVDA"])]).await;
    h.engine.connect().await.unwrap();

    let mut first = h.connector.next_server().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(first.drain_subscribes().len(), 3);

    drop(first);

    let mut second = h.connector.next_server().await;
    wait_until("reconnected", || h.engine.connection_state() == ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(second.drain_subscribes(), vec!["AAPL", "MSFT", "NVDA"]);

    let tokens = h.connector.tokens.lock().unwrap().clone();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);

    // Quotes flow again on the new session
    second.push(quotes_record(&[("MSFT", 400.0)]));
    wait_until("quote after reconnect", || last_price(&h.engine, "MSFT").as_deref() == Some("400.00")).await;

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_offline_watchlist_changes_subscribed_on_connect() {
    let h = harness(&[("QQQ", 400.0)]);
    h.engine.update_watchlists(vec![Watchlist::new("Main", &["QQQ"])]).await;
    assert_eq!(h.engine.reference_price("qqq"), Some(400.0));
    assert_eq!(h.baselines.fetches.load(Ordering::SeqCst), 1);

    h.engine.connect().await.unwrap();
    let mut server = h.connector.next_server().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.drain_subscribes(), vec!["QQQ"]);

    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_overlapping_watchlist_updates_apply_in_call_order() {
    let connector = Arc::new(MockConnector::default());
    let baselines = Arc::new(GatedBaselines {
        inner: MockBaselines::with(&[("AAA", 10.0), ("BBB", 20.0), ("CCC", 30.0)]),
        ..Default::default()
    });
    let engine = QuoteAlertEngine::new(test_config(), connector.clone(), baselines.clone(), None);

    let (first, second, _) = tokio::join!(
        engine.update_watchlists(vec![Watchlist::new("Main", &["AAA", "BBB"])]),
        engine.update_watchlists(vec![Watchlist::new("Main", &["BBB", "CCC"])]),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            baselines.release.notify_one();
        },
    );

    // The second update waits for the first instead of overtaking it
    assert_eq!(first, RefreshOutcome::Applied(2));
    assert_eq!(second, RefreshOutcome::Applied(2));
    assert_eq!(engine.reference_price("AAA"), None);
    assert_eq!(engine.reference_price("CCC"), Some(30.0));

    let mut watched: Vec<String> = engine.watched_symbols().iter().map(|s| s.as_str().to_string()).collect();
    watched.sort();
    assert_eq!(watched, vec!["BBB", "CCC"]);

    engine.connect().await.unwrap();
    let mut server = connector.next_server().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.drain_subscribes(), vec!["BBB", "CCC"]);

    engine.disconnect().await;
}

// ============================================================================
// TEST 6 – Lifecycle
// ============================================================================

#[tokio::test]
async fn test_initial_failure_surfaced_then_retry() {
    let h = harness(&[]);
    h.connector.fail_next_negotiations.store(1, Ordering::SeqCst);

    let err = h.engine.connect().await.unwrap_err();
    assert!(matches!(err, EngineError::Negotiation(_)));
    assert_eq!(h.engine.connection_state(), ConnectionState::Idle);

    h.engine.connect().await.unwrap();
    assert_eq!(h.engine.connection_state(), ConnectionState::Connected);
    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_no_handler_after_disconnect() {
    let h = harness(&[]);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.engine.on_quote_batch(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;
    server.push(quotes_record(&[("AAPL", 1.0)]));
    wait_until("handler call", || calls.load(Ordering::SeqCst) == 1).await;

    h.engine.disconnect().await;
    assert_eq!(h.engine.connection_state(), ConnectionState::Closed);

    let _ = server.to_client.send(quotes_record(&[("AAPL", 2.0)]));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.engine.connect().await.is_err());
}

#[tokio::test]
async fn test_filing_handler() {
    let h = harness(&[]);
    let forms = Arc::new(Mutex::new(Vec::new()));
    let sink = forms.clone();
    h.engine.on_filing_event(move |filing| {
        sink.lock().unwrap().push(filing.form.clone());
    });

    h.engine.connect().await.unwrap();
    let server = h.connector.next_server().await;
    server.push(
        r#"{"type":1,"target":"BroadcastFiling","arguments":[{"symbol":"AAPL","form":"10-Q","cik":320193}]}"#
            .to_string(),
    );

    wait_until("filing", || !forms.lock().unwrap().is_empty()).await;
    assert_eq!(*forms.lock().unwrap(), vec!["10-Q".to_string()]);
    h.engine.disconnect().await;
}

#[tokio::test]
async fn test_load_alerts_from_store() {
    let connector = Arc::new(MockConnector::default());
    let store = Arc::new(MockAlertStore {
        rules: vec![AlertRule::new("stored", "msft", 300.0, AlertDirection::Below).with_note("dip")],
        ..Default::default()
    });
    let engine = QuoteAlertEngine::new(
        test_config(),
        connector,
        Arc::new(MockBaselines::default()),
        Some(store),
    );

    assert_eq!(engine.load_alerts().await.unwrap(), 1);
    let alerts = engine.alerts();
    assert_eq!(alerts[0].symbol.as_str(), "MSFT");
    assert_eq!(alerts[0].note, "dip");
}
