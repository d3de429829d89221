// Subscription Tracker - which symbols the live session has been asked for
// Subscribe-only and per-session: `known` resets whenever a new session starts

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::core::types::Symbol;

#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    pub active: usize,
    pub subscribed: usize,
    pub session_live: bool,
    pub subscribe_requests: u64,
    pub sessions: u64,
}

impl fmt::Display for SubscriptionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subscriptions(active={}, subscribed={}, live={}, requests={}, sessions={})",
            self.active, self.subscribed, self.session_live, self.subscribe_requests, self.sessions
        )
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Latest desired set, kept across sessions
    active: HashSet<Symbol>,
    /// Symbols a subscribe has been issued for on the current session
    known: HashSet<Symbol>,
    live: bool,
    subscribe_requests: u64,
    sessions: u64,
}

impl TrackerState {
    fn take_new(&mut self) -> Vec<Symbol> {
        if !self.live {
            return Vec::new();
        }

        let mut fresh: Vec<Symbol> = self
            .active
            .iter()
            .filter(|s| !self.known.contains(*s))
            .cloned()
            .collect();
        fresh.sort();

        self.known.extend(fresh.iter().cloned());
        self.subscribe_requests += fresh.len() as u64;
        fresh
    }
}

/// Shared between the engine (reconcile) and the feed loop (session edges)
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    state: Mutex<TrackerState>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the desired set; returns the symbols that still need a subscribe
    /// on the live session (none while offline)
    pub fn reconcile(&self, active: &HashSet<Symbol>) -> Vec<Symbol> {
        let mut state = self.state.lock();
        state.active = active.clone();
        let fresh = state.take_new();
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "New symbols to subscribe");
        }
        fresh
    }

    /// A fresh session starts with nothing subscribed
    pub fn begin_session(&self) -> Vec<Symbol> {
        let mut state = self.state.lock();
        state.known.clear();
        state.live = true;
        state.sessions += 1;
        state.take_new()
    }

    pub fn end_session(&self) {
        let mut state = self.state.lock();
        state.live = false;
        state.known.clear();
    }

    /// Drop a failed subscribe so the next reconcile re-issues it
    pub fn forget(&self, symbol: &Symbol) {
        self.state.lock().known.remove(symbol);
    }

    pub fn active(&self) -> HashSet<Symbol> {
        self.state.lock().active.clone()
    }

    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.state.lock().known.contains(symbol)
    }

    pub fn get_stats(&self) -> SubscriptionStats {
        let state = self.state.lock();
        SubscriptionStats {
            active: state.active.len(),
            subscribed: state.known.len(),
            session_live: state.live,
            subscribe_requests: state.subscribe_requests,
            sessions: state.sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(symbols: &[&str]) -> HashSet<Symbol> {
        symbols.iter().map(|s| Symbol::new(s)).collect()
    }

    #[test]
    fn test_offline_reconcile_only_records() {
        let tracker = SubscriptionTracker::new();
        assert!(tracker.reconcile(&set(&["AAPL"])).is_empty());
        assert_eq!(tracker.active(), set(&["AAPL"]));
    }

    #[test]
    fn test_begin_session_subscribes_active_set() {
        let tracker = SubscriptionTracker::new();
        tracker.reconcile(&set(&["MSFT", "AAPL"]));

        let fresh = tracker.begin_session();
        assert_eq!(fresh, vec![Symbol::new("AAPL"), Symbol::new("MSFT")]);
    }

    #[test]
    fn test_no_duplicate_subscribe_within_session() {
        let tracker = SubscriptionTracker::new();
        tracker.begin_session();

        assert_eq!(tracker.reconcile(&set(&["AAPL"])), vec![Symbol::new("AAPL")]);
        assert!(tracker.reconcile(&set(&["AAPL"])).is_empty());
        assert_eq!(tracker.reconcile(&set(&["AAPL", "TSLA"])), vec![Symbol::new("TSLA")]);
        assert_eq!(tracker.get_stats().subscribe_requests, 2);
    }

    #[test]
    fn test_removed_symbol_not_resubscribed_until_readded() {
        let tracker = SubscriptionTracker::new();
        tracker.begin_session();
        tracker.reconcile(&set(&["AAPL", "TSLA"]));

        // Subscribe-only: removal leaves it known on this session
        assert!(tracker.reconcile(&set(&["AAPL"])).is_empty());
        assert!(tracker.reconcile(&set(&["AAPL", "TSLA"])).is_empty());
    }

    #[test]
    fn test_new_session_resubscribes() {
        let tracker = SubscriptionTracker::new();
        tracker.begin_session();
        tracker.reconcile(&set(&["AAPL", "NVDA"]));

        tracker.end_session();
        assert!(!tracker.is_subscribed(&Symbol::new("AAPL")));
        assert!(tracker.reconcile(&set(&["AAPL", "NVDA"])).is_empty());

        let fresh = tracker.begin_session();
        assert_eq!(fresh, vec![Symbol::new("AAPL"), Symbol::new("NVDA")]);
        assert_eq!(tracker.get_stats().sessions, 2);
    }

    #[test]
    fn test_forget_allows_retry() {
        let tracker = SubscriptionTracker::new();
        tracker.begin_session();
        tracker.reconcile(&set(&["BAD"]));

        tracker.forget(&Symbol::new("BAD"));
        assert_eq!(tracker.reconcile(&set(&["BAD"])), vec![Symbol::new("BAD")]);
    }
}
