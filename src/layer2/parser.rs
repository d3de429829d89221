// Message Parser - SignalR hub records into typed feed messages
// BroadcastQuotes, BroadcastFiling, invocation completions, pings and close

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::core::types::{Filing, RawQuote, Symbol};
use crate::layer1::websocket::create_invocation_message;

pub const BROADCAST_QUOTES: &str = "BroadcastQuotes";
pub const BROADCAST_FILING: &str = "BroadcastFiling";
pub const SUBSCRIBE_L1: &str = "SubL1";

// Hub message types
const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

// ============================================================================
// Parsed Message Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Quotes(Vec<RawQuote>),
    Filing(Filing),
    /// Result of an outbound invocation; `error` set on failure
    Completion { invocation_id: String, error: Option<String> },
    Ping,
    Close { error: Option<String> },
    /// Well-formed but not consumed by this engine
    Ignored(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid payload for {target}: {reason}")]
    InvalidPayload { target: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct HubRecord {
    #[serde(rename = "type")]
    kind: Option<u8>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(rename = "invocationId")]
    invocation_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub records_parsed: u64,
    pub quote_batches: u64,
    pub quotes_parsed: u64,
    pub quotes_rejected: u64,
    pub filings: u64,
    pub parse_errors: u64,
}

impl fmt::Display for ParserStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ParserStats(records={}, batches={}, quotes={}, rejected={}, filings={}, errors={})",
            self.records_parsed, self.quote_batches, self.quotes_parsed,
            self.quotes_rejected, self.filings, self.parse_errors
        )
    }
}

// ============================================================================
// Message Parser
// ============================================================================

/// Stateful only for statistics; owned by the single feed loop
#[derive(Debug, Default)]
pub struct MessageParser {
    stats: ParserStats,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one unframed hub record
    pub fn parse(&mut self, record: &str) -> Result<ParsedMessage, ParseError> {
        let result = self.parse_inner(record);
        match &result {
            Ok(_) => self.stats.records_parsed += 1,
            Err(e) => {
                self.stats.parse_errors += 1;
                warn!(error = %e, "Failed to parse hub record");
            }
        }
        result
    }

    fn parse_inner(&mut self, record: &str) -> Result<ParsedMessage, ParseError> {
        let hub: HubRecord = serde_json::from_str(record)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        match hub.kind.ok_or(ParseError::MissingField("type"))? {
            TYPE_INVOCATION => {
                let target = hub.target.ok_or(ParseError::MissingField("target"))?;
                match target.as_str() {
                    BROADCAST_QUOTES => self.parse_quotes(&hub.arguments).map(ParsedMessage::Quotes),
                    BROADCAST_FILING => self.parse_filing(&hub.arguments).map(ParsedMessage::Filing),
                    _ => {
                        debug!(target = %target, "Ignoring hub invocation");
                        Ok(ParsedMessage::Ignored(target))
                    }
                }
            }
            TYPE_COMPLETION => Ok(ParsedMessage::Completion {
                invocation_id: hub.invocation_id.ok_or(ParseError::MissingField("invocationId"))?,
                error: hub.error,
            }),
            TYPE_PING => Ok(ParsedMessage::Ping),
            TYPE_CLOSE => Ok(ParsedMessage::Close { error: hub.error }),
            other => Ok(ParsedMessage::Ignored(format!("type {}", other))),
        }
    }

    /// Entries with an empty symbol or non-finite price are dropped, the rest kept
    fn parse_quotes(&mut self, arguments: &[Value]) -> Result<Vec<RawQuote>, ParseError> {
        let entries = arguments
            .first()
            .and_then(|a| a.as_array())
            .ok_or_else(|| ParseError::InvalidPayload {
                target: BROADCAST_QUOTES.to_string(),
                reason: "first argument is not an array".to_string(),
            })?;

        let mut quotes = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<RawQuote>(entry.clone()) {
                Ok(q) if !q.symbol.is_empty() && q.last.is_finite() => quotes.push(q),
                Ok(q) => {
                    self.stats.quotes_rejected += 1;
                    warn!(symbol = %q.symbol, last = q.last, "Rejected invalid quote");
                }
                Err(e) => {
                    self.stats.quotes_rejected += 1;
                    warn!(error = %e, "Rejected malformed quote entry");
                }
            }
        }

        self.stats.quote_batches += 1;
        self.stats.quotes_parsed += quotes.len() as u64;
        Ok(quotes)
    }

    fn parse_filing(&mut self, arguments: &[Value]) -> Result<Filing, ParseError> {
        let raw = arguments.first().ok_or(ParseError::InvalidPayload {
            target: BROADCAST_FILING.to_string(),
            reason: "missing argument".to_string(),
        })?;

        let filing = serde_json::from_value::<Filing>(raw.clone()).map_err(|e| ParseError::InvalidPayload {
            target: BROADCAST_FILING.to_string(),
            reason: e.to_string(),
        })?;

        self.stats.filings += 1;
        Ok(filing)
    }

    pub fn get_stats(&self) -> ParserStats {
        self.stats.clone()
    }
}

/// Framed `SubL1(symbol)` invocation
pub fn create_subscribe_message(invocation_id: u32, symbol: &Symbol) -> String {
    create_invocation_message(
        &invocation_id.to_string(),
        SUBSCRIBE_L1,
        &[Value::from(symbol.as_str())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer1::websocket::RECORD_SEPARATOR;

    #[test]
    fn test_parse_quote_batch() {
        let mut parser = MessageParser::new();
        let msg = parser.parse(
            r#"{"type":1,"target":"BroadcastQuotes","arguments":[[{"s":"aapl","l":191.25,"o":189.0},{"s":"MSFT","l":410.1}]]}"#,
        ).unwrap();

        match msg {
            ParsedMessage::Quotes(quotes) => {
                assert_eq!(quotes.len(), 2);
                assert_eq!(quotes[0].symbol.as_str(), "AAPL");
                assert_eq!(quotes[0].open, Some(189.0));
                assert_eq!(quotes[1].last, 410.1);
            }
            other => panic!("expected quotes, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_batch() {
        let mut parser = MessageParser::new();
        let msg = parser.parse(r#"{"type":1,"target":"BroadcastQuotes","arguments":[[]]}"#).unwrap();
        assert_eq!(msg, ParsedMessage::Quotes(vec![]));
    }

    #[test]
    fn test_bad_entries_are_isolated() {
        let mut parser = MessageParser::new();
        let msg = parser.parse(
            r#"{"type":1,"target":"BroadcastQuotes","arguments":[[{"s":"","l":1.0},{"s":"X"},{"s":"GOOD","l":2.0}]]}"#,
        ).unwrap();

        assert_eq!(msg, ParsedMessage::Quotes(vec![RawQuote::new("GOOD", 2.0)]));
        assert_eq!(parser.get_stats().quotes_rejected, 2);
    }

    #[test]
    fn test_parse_filing() {
        let mut parser = MessageParser::new();
        let msg = parser.parse(
            r#"{"type":1,"target":"BroadcastFiling","arguments":[{"symbol":"TSLA","form":"8-K","dcn":"1","cik":1318605,"save_time":"2024-01-01","url":"https://sec.example/x"}]}"#,
        ).unwrap();

        match msg {
            ParsedMessage::Filing(f) => {
                assert_eq!(f.symbol, "TSLA");
                assert_eq!(f.form, "8-K");
                assert_eq!(f.cik, 1318605);
            }
            other => panic!("expected filing, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_completion_with_error() {
        let mut parser = MessageParser::new();
        let msg = parser.parse(r#"{"type":3,"invocationId":"4","error":"Unknown symbol"}"#).unwrap();
        assert_eq!(
            msg,
            ParsedMessage::Completion {
                invocation_id: "4".to_string(),
                error: Some("Unknown symbol".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_ping_close_and_unknown() {
        let mut parser = MessageParser::new();
        assert_eq!(parser.parse(r#"{"type":6}"#).unwrap(), ParsedMessage::Ping);
        assert_eq!(
            parser.parse(r#"{"type":7,"error":"server shutdown"}"#).unwrap(),
            ParsedMessage::Close { error: Some("server shutdown".to_string()) }
        );
        assert!(matches!(
            parser.parse(r#"{"type":1,"target":"BroadcastTweets","arguments":[]}"#).unwrap(),
            ParsedMessage::Ignored(_)
        ));
    }

    #[test]
    fn test_parse_errors_counted() {
        let mut parser = MessageParser::new();
        assert!(parser.parse("not json").is_err());
        assert!(parser.parse(r#"{"target":"x"}"#).is_err());
        assert!(parser.parse(r#"{"type":1,"target":"BroadcastQuotes","arguments":[{}]}"#).is_err());
        assert_eq!(parser.get_stats().parse_errors, 3);
    }

    #[test]
    fn test_subscribe_message() {
        let msg = create_subscribe_message(12, &Symbol::new("nvda"));
        assert!(msg.ends_with(RECORD_SEPARATOR));
        assert!(msg.contains("\"target\":\"SubL1\""));
        assert!(msg.contains("\"invocationId\":\"12\""));
        assert!(msg.contains("\"NVDA\""));
    }
}
