// Baseline Store - per-symbol reference ("previous close") prices
// Whole-map snapshot swaps; refresh is the sole writer

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::types::Symbol;
use crate::layer1::connector::BaselineSource;

pub type BaselineMap = HashMap<Symbol, f64>;

#[derive(Debug, Clone)]
pub struct BaselineStoreStats {
    pub symbols: usize,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub stale_results_dropped: u64,
    pub closed: bool,
}

impl fmt::Display for BaselineStoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Baselines(symbols={}, refreshes={}, failures={}, stale={}, closed={})",
            self.symbols, self.refreshes, self.refresh_failures,
            self.stale_results_dropped, self.closed
        )
    }
}

/// Outcome of one `refresh` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied(usize),
    /// A newer refresh already landed
    Superseded,
    /// Fetch failed; the previous map is still in place
    Failed,
    Closed,
}

pub struct BaselineStore {
    current: RwLock<Arc<BaselineMap>>,
    /// Ticket handed to each refresh at start
    issued: AtomicU64,
    /// Highest ticket whose result has been installed
    applied: parking_lot::Mutex<u64>,
    closed: AtomicBool,

    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    stale_results_dropped: AtomicU64,
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BaselineStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            issued: AtomicU64::new(0),
            applied: parking_lot::Mutex::new(0),
            closed: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            stale_results_dropped: AtomicU64::new(0),
        }
    }

    /// Fetch reference prices for exactly `symbols` and replace the whole map
    pub async fn refresh(&self, source: &dyn BaselineSource, symbols: &[Symbol]) -> RefreshOutcome {
        if self.closed.load(Ordering::Acquire) {
            return RefreshOutcome::Closed;
        }
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let map: BaselineMap = if symbols.is_empty() {
            HashMap::new()
        } else {
            match source.fetch_reference_prices(symbols).await {
                Ok(entries) => entries
                    .into_iter()
                    .filter(|e| e.reference_price.is_finite())
                    .map(|e| (e.symbol, e.reference_price))
                    .collect(),
                Err(e) => {
                    self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, symbols = symbols.len(), "Baseline refresh failed, keeping previous map");
                    return RefreshOutcome::Failed;
                }
            }
        };

        self.install(ticket, map)
    }

    fn install(&self, ticket: u64, map: BaselineMap) -> RefreshOutcome {
        let mut applied = self.applied.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!("Baseline store closed, dropping refresh result");
            return RefreshOutcome::Closed;
        }
        if ticket <= *applied {
            self.stale_results_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(ticket = ticket, applied = *applied, "Dropping superseded baseline refresh");
            return RefreshOutcome::Superseded;
        }

        let count = map.len();
        *self.current.write() = Arc::new(map);
        *applied = ticket;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(symbols = count, "Baselines refreshed");
        RefreshOutcome::Applied(count)
    }

    /// Case-insensitive lookup
    pub fn get(&self, symbol: &str) -> Option<f64> {
        let key = Symbol::new(symbol);
        self.current.read().get(&key).copied()
    }

    pub fn snapshot(&self) -> Arc<BaselineMap> {
        Arc::clone(&self.current.read())
    }

    /// No refresh result is installed after this returns
    pub fn close(&self) {
        let _guard = self.applied.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn get_stats(&self) -> BaselineStoreStats {
        BaselineStoreStats {
            symbols: self.current.read().len(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            stale_results_dropped: self.stale_results_dropped.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::BaselineFetchError;
    use crate::core::types::BaselineEntry;
    use futures::future::{BoxFuture, FutureExt};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct FixedSource {
        price: f64,
        fail: bool,
    }

    impl BaselineSource for FixedSource {
        fn fetch_reference_prices<'a>(
            &'a self,
            symbols: &'a [Symbol],
        ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>> {
            async move {
                if self.fail {
                    return Err(BaselineFetchError::Status(500));
                }
                Ok(symbols
                    .iter()
                    .map(|s| BaselineEntry { symbol: s.clone(), reference_price: self.price })
                    .collect())
            }
            .boxed()
        }
    }

    /// Blocks until released so an older refresh can finish after a newer one
    struct GatedSource {
        gate: Notify,
        price: f64,
    }

    impl BaselineSource for GatedSource {
        fn fetch_reference_prices<'a>(
            &'a self,
            symbols: &'a [Symbol],
        ) -> BoxFuture<'a, Result<Vec<BaselineEntry>, BaselineFetchError>> {
            async move {
                self.gate.notified().await;
                Ok(symbols
                    .iter()
                    .map(|s| BaselineEntry { symbol: s.clone(), reference_price: self.price })
                    .collect())
            }
            .boxed()
        }
    }

    fn syms(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(|s| Symbol::new(s)).collect()
    }

    #[tokio::test]
    async fn test_refresh_and_case_insensitive_get() {
        let store = BaselineStore::new();
        let source = FixedSource { price: 100.0, fail: false };

        let outcome = store.refresh(&source, &syms(&["AAPL", "MSFT"])).await;
        assert_eq!(outcome, RefreshOutcome::Applied(2));
        assert_eq!(store.get("aapl"), Some(100.0));
        assert_eq!(store.get("NVDA"), None);
    }

    #[tokio::test]
    async fn test_refresh_replaces_whole_map() {
        let store = BaselineStore::new();
        store.refresh(&FixedSource { price: 1.0, fail: false }, &syms(&["A", "B"])).await;
        store.refresh(&FixedSource { price: 2.0, fail: false }, &syms(&["B"])).await;

        assert_eq!(store.get("A"), None);
        assert_eq!(store.get("B"), Some(2.0));
    }

    #[tokio::test]
    async fn test_empty_symbol_set_clears_without_fetch() {
        let store = BaselineStore::new();
        store.refresh(&FixedSource { price: 1.0, fail: false }, &syms(&["A"])).await;

        let outcome = store.refresh(&FixedSource { price: 0.0, fail: true }, &[]).await;
        assert_eq!(outcome, RefreshOutcome::Applied(0));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_map() {
        let store = BaselineStore::new();
        store.refresh(&FixedSource { price: 50.0, fail: false }, &syms(&["AMD"])).await;

        let outcome = store.refresh(&FixedSource { price: 0.0, fail: true }, &syms(&["AMD"])).await;
        assert_eq!(outcome, RefreshOutcome::Failed);
        assert_eq!(store.get("AMD"), Some(50.0));
        assert_eq!(store.get_stats().refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_older_refresh_never_overwrites_newer() {
        let store = Arc::new(BaselineStore::new());
        let slow = Arc::new(GatedSource { gate: Notify::new(), price: 1.0 });

        let older = {
            let store = Arc::clone(&store);
            let slow = Arc::clone(&slow);
            tokio::spawn(async move { store.refresh(slow.as_ref(), &syms(&["X"])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let newer = store.refresh(&FixedSource { price: 2.0, fail: false }, &syms(&["X"])).await;
        assert_eq!(newer, RefreshOutcome::Applied(1));

        slow.gate.notify_one();
        assert_eq!(older.await.unwrap(), RefreshOutcome::Superseded);
        assert_eq!(store.get("X"), Some(2.0));
    }

    #[tokio::test]
    async fn test_nothing_applied_after_close() {
        let store = Arc::new(BaselineStore::new());
        let slow = Arc::new(GatedSource { gate: Notify::new(), price: 9.0 });

        let pending = {
            let store = Arc::clone(&store);
            let slow = Arc::clone(&slow);
            tokio::spawn(async move { store.refresh(slow.as_ref(), &syms(&["X"])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.close();
        slow.gate.notify_one();

        assert_eq!(pending.await.unwrap(), RefreshOutcome::Closed);
        assert_eq!(store.get("X"), None);
    }
}
