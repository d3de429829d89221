// Alert Engine - directional price alerts, at most one trigger per rule
// Evaluates every inbound tick (watched or not) against the rules for its symbol

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::PersistenceError;
use crate::core::types::{AlertRule, RawQuote, Symbol, TriggerEvent};
use crate::layer1::connector::AlertStore;
use crate::layer3::notifications::NotificationSink;

#[derive(Debug, Clone)]
pub struct AlertEngineStats {
    pub rules: usize,
    pub active: usize,
    pub triggered: usize,
    pub evaluations: u64,
    pub triggers: u64,
    pub persist_failures: u64,
}

impl fmt::Display for AlertEngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alerts(rules={}, active={}, triggered={}, evaluations={}, triggers={}, persist_failures={})",
            self.rules, self.active, self.triggered, self.evaluations, self.triggers, self.persist_failures
        )
    }
}

/// A rule plus the authoritative triggered bit for this session
#[derive(Debug)]
struct AlertSlot {
    rule: AlertRule,
    triggered: AtomicBool,
}

impl AlertSlot {
    fn new(rule: AlertRule) -> Self {
        let triggered = AtomicBool::new(rule.triggered);
        Self { rule, triggered }
    }

    fn snapshot(&self) -> AlertRule {
        let mut rule = self.rule.clone();
        rule.triggered = self.triggered.load(Ordering::Acquire);
        rule
    }

    /// Active -> Triggered exactly once
    fn try_trigger(&self) -> bool {
        self.triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct RuleIndex {
    by_id: HashMap<String, Arc<AlertSlot>>,
    by_symbol: HashMap<Symbol, Vec<Arc<AlertSlot>>>,
}

impl RuleIndex {
    /// Insert or replace by id. A bit already set this session is never lowered.
    fn insert(&mut self, mut rule: AlertRule) {
        if let Some(prev) = self.remove(&rule.id) {
            rule.triggered |= prev.triggered.load(Ordering::Acquire);
        }
        let slot = Arc::new(AlertSlot::new(rule));
        self.by_symbol
            .entry(slot.rule.symbol.clone())
            .or_default()
            .push(Arc::clone(&slot));
        self.by_id.insert(slot.rule.id.clone(), slot);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<AlertSlot>> {
        let slot = self.by_id.remove(id)?;
        if let Some(list) = self.by_symbol.get_mut(&slot.rule.symbol) {
            list.retain(|s| s.rule.id != id);
            if list.is_empty() {
                self.by_symbol.remove(&slot.rule.symbol);
            }
        }
        Some(slot)
    }
}

pub struct AlertEngine {
    index: RwLock<RuleIndex>,
    /// Most recent raw price per symbol, for relative targets
    last_prices: RwLock<HashMap<Symbol, f64>>,
    sink: Arc<NotificationSink>,
    store: Option<Arc<dyn AlertStore>>,

    evaluations: AtomicU64,
    triggers: AtomicU64,
    persist_failures: Arc<AtomicU64>,
}

impl AlertEngine {
    pub fn new(sink: Arc<NotificationSink>, store: Option<Arc<dyn AlertStore>>) -> Self {
        Self {
            index: RwLock::new(RuleIndex::default()),
            last_prices: RwLock::new(HashMap::new()),
            sink,
            store,
            evaluations: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            persist_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Insert or replace by id. Rules with an empty symbol or unusable target are refused.
    pub fn add_rule(&self, rule: AlertRule) -> bool {
        if rule.symbol.is_empty() || !rule.target_price.is_finite() {
            warn!(rule_id = %rule.id, "Refusing invalid alert rule");
            return false;
        }
        debug!(rule = %rule, "Alert rule added");
        self.index.write().insert(rule);
        true
    }

    pub fn remove_rule(&self, id: &str) -> Option<AlertRule> {
        self.index.write().remove(id).map(|slot| slot.snapshot())
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self.index.read().by_id.values().map(|s| s.snapshot()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn rules_for(&self, symbol: &str) -> Vec<AlertRule> {
        self.index
            .read()
            .by_symbol
            .get(&Symbol::new(symbol))
            .map(|slots| slots.iter().map(|s| s.snapshot()).collect())
            .unwrap_or_default()
    }

    /// Symbols with at least one rule still armed
    pub fn armed_symbols(&self) -> HashSet<Symbol> {
        self.index
            .read()
            .by_symbol
            .iter()
            .filter(|(_, slots)| slots.iter().any(|s| !s.triggered.load(Ordering::Acquire)))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.read().get(&Symbol::new(symbol)).copied()
    }

    /// Merge the store's rules into the local set; rules already triggered stay inert
    pub async fn load_from_store(&self) -> Result<usize, PersistenceError> {
        let store = self.store.as_ref().ok_or(PersistenceError::NotConfigured)?;
        let rules = store.load_rules().await?;

        let mut loaded = 0;
        for rule in rules {
            if self.add_rule(rule) {
                loaded += 1;
            }
        }
        info!(count = loaded, "Alert rules loaded from store");
        Ok(loaded)
    }

    /// Evaluate one batch in order. Each rule fires at most once, ever.
    pub fn evaluate(&self, quotes: &[RawQuote]) -> Vec<TriggerEvent> {
        let mut fired = Vec::new();
        {
            let index = self.index.read();
            let mut last_prices = self.last_prices.write();

            for quote in quotes {
                if !quote.last.is_finite() {
                    continue;
                }
                last_prices.insert(quote.symbol.clone(), quote.last);

                let Some(slots) = index.by_symbol.get(&quote.symbol) else {
                    continue;
                };
                for slot in slots {
                    self.evaluations.fetch_add(1, Ordering::Relaxed);
                    if slot.triggered.load(Ordering::Acquire) {
                        continue;
                    }
                    let rule = &slot.rule;
                    if rule.direction.is_satisfied(quote.last, rule.target_price) && slot.try_trigger() {
                        fired.push(TriggerEvent {
                            rule_id: rule.id.clone(),
                            symbol: rule.symbol.clone(),
                            direction: rule.direction,
                            target_price: rule.target_price,
                            price: quote.last,
                        });
                    }
                }
            }
        }

        for event in &fired {
            self.triggers.fetch_add(1, Ordering::Relaxed);
            info!(rule_id = %event.rule_id, symbol = %event.symbol, price = event.price, "Alert triggered");
            self.sink.push(event.message());
            self.persist_triggered(&event.rule_id);
        }
        fired
    }

    /// Best-effort; never blocks evaluation
    fn persist_triggered(&self, rule_id: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(rule_id = rule_id, "No runtime available, triggered state not persisted");
                return;
            }
        };

        let rule_id = rule_id.to_string();
        let failures = Arc::clone(&self.persist_failures);
        handle.spawn(async move {
            if let Err(e) = store.mark_triggered(&rule_id).await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(rule_id = %rule_id, error = %e, "Failed to mark alert triggered");
            }
        });
    }

    pub fn get_stats(&self) -> AlertEngineStats {
        let index = self.index.read();
        let triggered = index
            .by_id
            .values()
            .filter(|s| s.triggered.load(Ordering::Acquire))
            .count();

        AlertEngineStats {
            rules: index.by_id.len(),
            active: index.by_id.len() - triggered,
            triggered,
            evaluations: self.evaluations.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}
