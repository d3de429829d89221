// Quote Processor - merges inbound quote batches with baselines
// Pure transform: batch + baseline snapshot + membership snapshot -> display updates

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::core::types::{DisplayQuote, RawQuote, Symbol};
use crate::layer2::baseline_store::BaselineMap;

/// Result of processing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedBatch {
    /// One replacement record per updated symbol, first-seen order
    pub updates: Vec<DisplayQuote>,
    /// Ticks for symbols outside every open watch-list, or with unusable prices
    pub discarded: usize,
}

impl fmt::Display for ProcessedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessedBatch(updates={}, discarded={})", self.updates.len(), self.discarded)
    }
}

pub fn format_price(last: f64) -> String {
    format!("{:.2}", last)
}

/// Signed two-decimal percent change; `None` when there is no usable baseline
pub fn format_percent_change(last: f64, reference: f64) -> Option<String> {
    if !reference.is_finite() || reference <= 0.0 || !last.is_finite() {
        return None;
    }
    let pct = (last - reference) / reference * 100.0;
    let formatted = format!("{:+.2}%", pct);
    // Tiny negative moves round to "-0.00%"
    if formatted == "-0.00%" {
        Some("+0.00%".to_string())
    } else {
        Some(formatted)
    }
}

/// Apply a batch to the prior display records.
///
/// Symbols absent from `membership` are discarded. Without a baseline only
/// `last_price` changes; the prior `percent_change` is kept. A symbol repeated
/// within the batch resolves to its last tick.
pub fn process_batch(
    batch: &[RawQuote],
    baselines: &BaselineMap,
    membership: &HashSet<Symbol>,
    prior: &HashMap<Symbol, DisplayQuote>,
) -> ProcessedBatch {
    let mut order: Vec<Symbol> = Vec::new();
    let mut latest: HashMap<Symbol, f64> = HashMap::new();
    let mut discarded = 0;

    for quote in batch {
        if !quote.last.is_finite() || !membership.contains(&quote.symbol) {
            discarded += 1;
            continue;
        }
        if latest.insert(quote.symbol.clone(), quote.last).is_none() {
            order.push(quote.symbol.clone());
        }
    }

    let updates = order
        .into_iter()
        .filter_map(|symbol| {
            let last = latest.get(&symbol).copied()?;
            let percent_change = baselines
                .get(&symbol)
                .and_then(|p0| format_percent_change(last, *p0))
                .or_else(|| prior.get(&symbol).map(|q| q.percent_change.clone()))
                .unwrap_or_else(|| DisplayQuote::INITIAL_CHANGE.to_string());

            Some(DisplayQuote {
                symbol,
                last_price: format_price(last),
                percent_change,
            })
        })
        .collect();

    ProcessedBatch { updates, discarded }
}
