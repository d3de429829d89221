// Core Type Definitions for the Quote & Alert Engine
// Symbols, quotes, baselines, alert rules and connection states

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

// ============================================================================
// Symbol
// ============================================================================

/// Canonical (uppercase) ticker symbol.
///
/// Every constructor and deserializer canonicalizes, so two `Symbol`s compare
/// equal iff their tickers match case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: &str) -> Self {
        Symbol(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Symbol::new(&raw)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Symbol::new(raw)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Above,
    Below,
}

impl AlertDirection {
    /// Boundary-inclusive crossing test against a raw last price.
    pub fn is_satisfied(&self, last: f64, target: f64) -> bool {
        match self {
            AlertDirection::Above => last >= target,
            AlertDirection::Below => last <= target,
        }
    }
}

impl fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertDirection::Above => write!(f, "above"),
            AlertDirection::Below => write!(f, "below"),
        }
    }
}

impl std::str::FromStr for AlertDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "above" => Ok(AlertDirection::Above),
            "below" => Ok(AlertDirection::Below),
            _ => Err(format!("Invalid AlertDirection: '{}'. Expected 'above' or 'below'", s)),
        }
    }
}

// ============================================================================
// Feed Data
// ============================================================================

/// One tick as delivered inside a `BroadcastQuotes` batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuote {
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "l")]
    pub last: f64,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
}

impl RawQuote {
    pub fn new(symbol: &str, last: f64) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            last,
            open: None,
        }
    }
}

impl fmt::Display for RawQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawQuote({} last={})", self.symbol, self.last)
    }
}

/// Filing notice carried on the same session; passed through untouched
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Filing {
    pub symbol: String,
    pub form: String,
    pub dcn: String,
    pub cik: u64,
    pub save_time: String,
    pub url: String,
}

// ============================================================================
// Derived / Display Data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub symbol: Symbol,
    pub reference_price: f64,
}

/// Display-ready record for one watched symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayQuote {
    pub symbol: Symbol,
    pub last_price: String,
    pub percent_change: String,
}

impl DisplayQuote {
    pub const INITIAL_PRICE: &'static str = "0.00";
    pub const INITIAL_CHANGE: &'static str = "+0.00%";

    pub fn placeholder(symbol: Symbol) -> Self {
        Self {
            symbol,
            last_price: Self::INITIAL_PRICE.to_string(),
            percent_change: Self::INITIAL_CHANGE.to_string(),
        }
    }
}

impl fmt::Display for DisplayQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.symbol, self.last_price, self.percent_change)
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// A directional price alert as stored by the alert persistence service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub symbol: Symbol,
    #[serde(rename = "target")]
    pub target_price: f64,
    pub direction: AlertDirection,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub triggered: bool,
}

impl AlertRule {
    pub fn new(id: &str, symbol: &str, target_price: f64, direction: AlertDirection) -> Self {
        Self {
            id: id.to_string(),
            symbol: Symbol::new(symbol),
            target_price,
            direction,
            note: String::new(),
            triggered: false,
        }
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.note = note.to_string();
        self
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AlertRule({} {} {} {:.2} triggered={})",
            self.id, self.symbol, self.direction, self.target_price, self.triggered
        )
    }
}

/// Emitted once when a rule moves from active to triggered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub rule_id: String,
    pub symbol: Symbol,
    pub direction: AlertDirection,
    pub target_price: f64,
    pub price: f64,
}

impl TriggerEvent {
    pub fn message(&self) -> String {
        format!("🔔 {} is {} {:.2}", self.symbol, self.direction, self.target_price)
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriggerEvent(rule={}, {} {} {:.2} at {:.2})",
            self.rule_id, self.symbol, self.direction, self.target_price, self.price
        )
    }
}

/// Resolve user target input: `"+5"` / `"-2.5"` are offsets from `last_price`,
/// anything else is parsed as an absolute price.
pub fn resolve_target(input: &str, last_price: Option<f64>) -> Option<f64> {
    let input = input.trim();
    let is_relative = input.starts_with('+') || input.starts_with('-');

    if is_relative {
        if let (Ok(delta), Some(base)) = (input.parse::<f64>(), last_price) {
            if delta.is_finite() && base.is_finite() {
                return Some(base + delta);
            }
        }
    }

    input.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
