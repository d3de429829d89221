// Event System for the Quote & Alert Engine
// Typed engine events fanned out to presentation layers over a tokio broadcast channel

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::broadcast;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::core::types::{now_millis, ConnectionState, DisplayQuote, Filing, TriggerEvent};

// ============================================================================
// Engine Event
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    QuoteUpdated(DisplayQuote),
    AlertTriggered(TriggerEvent),
    ConnectionChanged(ConnectionState),
    Filing(Filing),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::QuoteUpdated(_) => "quote_updated",
            EngineEvent::AlertTriggered(_) => "alert_triggered",
            EngineEvent::ConnectionChanged(_) => "connection_changed",
            EngineEvent::Filing(_) => "filing",
        }
    }
}

/// An engine event with identity and publish time
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: i64,
    pub payload: EngineEvent,
}

impl Event {
    pub fn new(payload: EngineEvent) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            payload,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(type={}, id={})",
            self.payload.kind(),
            &self.event_id[..8]
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    event_history: RwLock<VecDeque<Event>>,
    max_history: usize,
    stats: RwLock<EventBusStats>,
}

#[derive(Debug, Clone, Default)]
struct EventBusStats {
    total_published: u64,
    undelivered: u64,
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        let (tx, _rx) = broadcast::channel(1024);

        Self {
            tx,
            event_history: RwLock::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    pub fn publish(&self, payload: EngineEvent) {
        let event = Event::new(payload);

        {
            let mut history = self.event_history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let delivered = self.tx.send(event).is_ok();

        let mut stats = self.stats.write();
        stats.total_published += 1;
        if !delivered {
            stats.undelivered += 1;
        }
    }

    /// Receiver for all events published from now on
    pub fn subscribe_channel(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Most recent first, optionally filtered by `EngineEvent::kind`
    pub fn get_recent_events(&self, kind: Option<&str>, limit: Option<usize>) -> Vec<Event> {
        let history = self.event_history.read();
        let limit = limit.unwrap_or(100);

        history
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.payload.kind() == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> EventBusStatsSnapshot {
        let stats = self.stats.read();
        EventBusStatsSnapshot {
            total_published: stats.total_published,
            undelivered: stats.undelivered,
            receiver_count: self.tx.receiver_count(),
            history_size: self.event_history.read().len(),
        }
    }

    pub fn clear_history(&self) {
        self.event_history.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[derive(Debug, Clone)]
pub struct EventBusStatsSnapshot {
    pub total_published: u64,
    pub undelivered: u64,
    pub receiver_count: usize,
    pub history_size: usize,
}

impl fmt::Display for EventBusStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventBusStats(published={}, undelivered={}, receivers={}, history={})",
            self.total_published, self.undelivered, self.receiver_count, self.history_size
        )
    }
}
