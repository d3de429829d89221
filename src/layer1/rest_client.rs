// REST Client for the Quote Feed backend - Pure Rust
// Session negotiation, previous-close lookup and alert persistence over reqwest

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{BaselineFetchError, NegotiationError, PersistenceError};
use crate::core::types::{AlertRule, BaselineEntry, Symbol};
use crate::layer1::connector::{AlertStore, BaselineSource, SessionDescriptor};

// ============================================================================
// Wire Formats
// ============================================================================

#[derive(Debug, Deserialize)]
struct NegotiateResponse {
    #[serde(alias = "Url")]
    url: Option<String>,
    #[serde(alias = "AccessToken", alias = "accessToken")]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrevCloseItem {
    #[serde(alias = "Ti")]
    ticker: Option<String>,
    #[serde(alias = "c", alias = "closePrice")]
    close_price: Option<f64>,
}

/// Parse a negotiation body into a session descriptor
pub fn parse_negotiate_response(body: Value) -> Result<SessionDescriptor, NegotiationError> {
    let parsed: NegotiateResponse = serde_json::from_value(body)
        .map_err(|_| NegotiationError::MissingField("Url"))?;

    let url = parsed.url.filter(|u| !u.is_empty()).ok_or(NegotiationError::MissingField("Url"))?;
    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or(NegotiationError::MissingField("AccessToken"))?;

    Ok(SessionDescriptor { url, access_token })
}

/// Parse `{"results": [...]}`; entries without a ticker or a finite close are skipped
pub fn parse_prev_closes(body: &Value) -> Vec<BaselineEntry> {
    let Some(results) = body.get("results").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|item| serde_json::from_value::<PrevCloseItem>(item.clone()).ok())
        .filter_map(|item| match (item.ticker, item.close_price) {
            (Some(ticker), Some(price)) if !ticker.trim().is_empty() && price.is_finite() => {
                Some(BaselineEntry {
                    symbol: Symbol::new(&ticker),
                    reference_price: price,
                })
            }
            _ => None,
        })
        .collect()
}

/// `A,B,C` query value for the previous-close endpoint
pub fn symbols_param(symbols: &[Symbol]) -> String {
    symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub success_rate: f64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, rate={:.2}%)",
            self.requests_sent, self.requests_succeeded, self.requests_failed,
            self.success_rate * 100.0
        )
    }
}

// ============================================================================
// Feed REST Client
// ============================================================================

/// HTTP side of the feed backend
///
/// Features:
/// - Session negotiation (never retried here; callers decide)
/// - Previous-close lookup for baseline refresh
/// - Alert listing and best-effort "mark triggered" writes
pub struct FeedRestClient {
    negotiate_url: String,
    prev_close_url: String,
    alerts_url: String,
    auth_token: String,

    client: Client,
    /// Per-request override for previous-close lookups
    baseline_timeout: Duration,

    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
}

impl FeedRestClient {
    pub fn new(
        negotiate_url: &str,
        prev_close_url: &str,
        alerts_url: &str,
        auth_token: &str,
        timeout_seconds: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            negotiate_url: negotiate_url.to_string(),
            prev_close_url: prev_close_url.to_string(),
            alerts_url: alerts_url.to_string(),
            auth_token: auth_token.to_string(),
            client,
            baseline_timeout: Duration::from_secs(timeout_seconds),
            requests_sent: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = Self::new(
            &config.feed.negotiate_url,
            &config.baseline.prev_close_url,
            &config.alerts.alerts_url,
            &config.alerts.auth_token,
            config.feed.request_timeout_seconds,
        )?;
        Ok(client.with_baseline_timeout(Duration::from_secs(config.baseline.request_timeout_seconds)))
    }

    pub fn with_baseline_timeout(mut self, timeout: Duration) -> Self {
        self.baseline_timeout = timeout;
        self
    }

    pub fn baseline_timeout(&self) -> Duration {
        self.baseline_timeout
    }

    fn record(&self, ok: bool) {
        if ok {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.auth_token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.auth_token)
        }
    }

    /// Phase one of connecting: obtain `{url, access_token}`
    pub async fn negotiate(&self) -> Result<SessionDescriptor, NegotiationError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.negotiate_url, "Negotiating feed session");

        let response = match self.client.post(&self.negotiate_url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record(false);
                return Err(NegotiationError::Http(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.record(false);
            return Err(NegotiationError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                self.record(false);
                return Err(NegotiationError::Http(e));
            }
        };

        let descriptor = parse_negotiate_response(body);
        self.record(descriptor.is_ok());
        descriptor
    }

    pub async fn get_prev_closes(&self, symbols: &[Symbol]) -> Result<Vec<BaselineEntry>, BaselineFetchError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let result = async {
            let response = self
                .client
                .get(&self.prev_close_url)
                .query(&[("symbols", symbols_param(symbols))])
                .timeout(self.baseline_timeout)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(BaselineFetchError::Status(status.as_u16()));
            }

            // An empty body means "no closes known"
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Vec::new());
            }
            let body: Value = serde_json::from_str(&text)?;
            Ok(parse_prev_closes(&body))
        }
        .await;

        self.record(result.is_ok());
        if let Ok(entries) = &result {
            debug!(requested = symbols.len(), received = entries.len(), "Previous closes fetched");
        }
        result
    }

    pub async fn get_alerts(&self) -> Result<Vec<AlertRule>, PersistenceError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let result = async {
            let response = self.authorized(self.client.get(&self.alerts_url)).send().await?;
            if response.status() != StatusCode::OK {
                return Err(PersistenceError::Status(response.status().as_u16()));
            }
            Ok(response.json::<Vec<AlertRule>>().await?)
        }
        .await;

        self.record(result.is_ok());
        if let Ok(rules) = &result {
            info!(count = rules.len(), "Alert rules loaded");
        }
        result
    }

    pub async fn patch_alert_triggered(&self, rule_id: &str) -> Result<(), PersistenceError> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let body = serde_json::json!({ "id": rule_id, "triggered": true });
        let result = async {
            let response = self
                .authorized(self.client.patch(&self.alerts_url))
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(PersistenceError::Status(response.status().as_u16()));
            }
            Ok(())
        }
        .await;

        self.record(result.is_ok());
        if let Err(e) = &result {
            warn!(rule_id = rule_id, error = %e, "Failed to persist triggered alert");
        }
        result
    }

    pub fn get_stats(&self) -> RestClientStats {
        let sent = self.requests_sent.load(Ordering::Relaxed);
        let ok = self.requests_succeeded.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);

        RestClientStats {
            requests_sent: sent,
            requests_succeeded: ok,
            requests_failed: failed,
            success_rate: if sent > 0 { ok as f64 / sent as f64 } else { 0.0 },
        }
    }
}

impl BaselineSource for FeedRestClient {
    fn fetch_reference_prices<'a>(
        &'a self,
        symbols: &'a [Symbol],
    ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>> {
        self.get_prev_closes(symbols).boxed()
    }
}

impl AlertStore for FeedRestClient {
    fn load_rules(&self) -> BoxFuture<'_, Result<Vec<AlertRule>, PersistenceError>> {
        self.get_alerts().boxed()
    }

    fn mark_triggered<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, Result<(), PersistenceError>> {
        self.patch_alert_triggered(rule_id).boxed()
    }
}
