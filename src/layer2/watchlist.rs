// Display Board - open watch-lists and the latest display record per symbol
// Copy-on-write snapshots so readers never block the quote worker

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::types::{DisplayQuote, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watchlist {
    pub name: String,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
}

impl Watchlist {
    pub fn new(name: &str, symbols: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            symbols: symbols.iter().map(|s| Symbol::new(s)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchlistRow {
    pub symbol: Symbol,
    pub last_price: String,
    pub percent_change: String,
}

impl From<&DisplayQuote> for WatchlistRow {
    fn from(q: &DisplayQuote) -> Self {
        Self {
            symbol: q.symbol.clone(),
            last_price: q.last_price.clone(),
            percent_change: q.percent_change.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoardSnapshot {
    pub watchlists: Vec<Watchlist>,
    /// Union of symbols across every open watch-list
    pub membership: HashSet<Symbol>,
    pub quotes: HashMap<Symbol, DisplayQuote>,
}

#[derive(Debug, Default)]
pub struct DisplayBoard {
    current: RwLock<Arc<BoardSnapshot>>,
}

impl DisplayBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the open watch-lists. New symbols get placeholder rows, symbols
    /// no longer watched are dropped. Returns the new membership.
    pub fn set_watchlists(&self, watchlists: Vec<Watchlist>) -> HashSet<Symbol> {
        let mut current = self.current.write();

        let membership: HashSet<Symbol> = watchlists
            .iter()
            .flat_map(|w| w.symbols.iter())
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();

        let quotes = membership
            .iter()
            .map(|symbol| {
                let quote = current
                    .quotes
                    .get(symbol)
                    .cloned()
                    .unwrap_or_else(|| DisplayQuote::placeholder(symbol.clone()));
                (symbol.clone(), quote)
            })
            .collect();

        *current = Arc::new(BoardSnapshot {
            watchlists,
            membership: membership.clone(),
            quotes,
        });
        membership
    }

    pub fn snapshot(&self) -> Arc<BoardSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn membership(&self) -> HashSet<Symbol> {
        self.current.read().membership.clone()
    }

    /// Install display updates; symbols dropped since processing began are skipped
    pub fn apply(&self, updates: &[DisplayQuote]) -> usize {
        if updates.is_empty() {
            return 0;
        }

        let mut current = self.current.write();
        let mut next = BoardSnapshot::clone(&current);
        let mut applied = 0;
        for update in updates {
            if next.membership.contains(&update.symbol) {
                next.quotes.insert(update.symbol.clone(), update.clone());
                applied += 1;
            }
        }
        if applied > 0 {
            *current = Arc::new(next);
        }
        applied
    }

    pub fn quote(&self, symbol: &str) -> Option<DisplayQuote> {
        self.current.read().quotes.get(&Symbol::new(symbol)).cloned()
    }

    /// Rows of one open watch-list in its own symbol order
    pub fn rows(&self, name: &str) -> Option<Vec<WatchlistRow>> {
        let snapshot = self.snapshot();
        let watchlist = snapshot.watchlists.iter().find(|w| w.name == name)?;
        Some(
            watchlist
                .symbols
                .iter()
                .filter_map(|s| snapshot.quotes.get(s))
                .map(WatchlistRow::from)
                .collect(),
        )
    }
}
