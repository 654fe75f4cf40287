//! Block-indexed trade-volume window
//!
//! Keeps one record per observed block height, bounded to the configured
//! backfill depth, and folds the window into a rolling total per symbol.
//! Every record carries both directions of every registered pair so an
//! inverted pair can look up its volume directly.

pub mod store;

pub use store::{CsvVolumeStore, MemoryVolumeStore, VolumeStore};

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::CurrencyPair;

/// Reconstructed trade volumes for one block height.
#[derive(Debug, Clone)]
pub struct Volume {
    pub height: u64,
    /// Block timestamp, unix seconds.
    pub time: i64,
    /// Symbol -> traded amount. Holds `BASEQUOTE` and `QUOTEBASE` for every
    /// registered pair, zero when untraded.
    pub values: HashMap<String, Decimal>,
}

/// Ordered-by-height window of volume records with derived per-symbol
/// totals.
pub struct VolumeHistory {
    provider: String,
    symbols: Vec<String>,
    depth: u64,
    records: Vec<Volume>,
    totals: HashMap<String, Decimal>,
    store: Arc<dyn VolumeStore>,
}

impl VolumeHistory {
    /// Create a window for the given pairs, hydrating any persisted records
    /// for this provider from the store.
    pub fn new(
        provider: &str,
        pairs: &[CurrencyPair],
        depth: u64,
        store: Arc<dyn VolumeStore>,
    ) -> anyhow::Result<Self> {
        let mut symbols = Vec::with_capacity(pairs.len() * 2);
        for pair in pairs {
            symbols.push(pair.symbol());
            symbols.push(pair.swap().symbol());
        }
        symbols.sort();
        symbols.dedup();

        let mut history = Self {
            provider: provider.to_string(),
            symbols,
            depth,
            records: Vec::new(),
            totals: HashMap::new(),
            store,
        };

        let persisted = history.store.load(provider, &history.symbols)?;
        if !persisted.is_empty() {
            debug!(
                provider,
                records = persisted.len(),
                "hydrated volume window from store"
            );
            history.insert(persisted, false);
        }

        Ok(history)
    }

    /// Both directions of every registered pair.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// A fresh values map with explicit zeros for every symbol. Untraded is
    /// a valid market state, not a missing value.
    pub fn zero_values(&self) -> HashMap<String, Decimal> {
        self.symbols
            .iter()
            .map(|s| (s.clone(), Decimal::ZERO))
            .collect()
    }

    pub fn latest_height(&self) -> Option<u64> {
        self.records.last().map(|r| r.height)
    }

    pub fn contains(&self, height: u64) -> bool {
        self.records.iter().any(|r| r.height == height)
    }

    /// The most recent `depth` heights below the latest recorded height that
    /// are not yet in the window, ascending, always ending with the sentinel
    /// `0` ("also fetch the current head"). Never returns a height already
    /// present.
    pub fn missing(&self, depth: u64) -> Vec<u64> {
        let mut heights = Vec::new();

        if let Some(latest) = self.latest_height() {
            let floor = latest.saturating_sub(depth);
            for height in floor..latest {
                if height > 0 && !self.contains(height) {
                    heights.push(height);
                }
            }
        }

        heights.push(0);
        heights
    }

    /// Append newly fetched records. Heights already present are skipped,
    /// not merged; the window is re-sorted, pruned and its totals
    /// recomputed, then persisted.
    pub fn add(&mut self, records: Vec<Volume>) {
        if self.insert(records, true) {
            if let Err(e) = self.store.save(&self.provider, &self.records) {
                warn!(provider = %self.provider, error = %e, "failed to persist volume window");
            }
        }
    }

    /// Rolling total for a symbol across the window. Zero when untraded or
    /// unknown.
    pub fn total(&self, symbol: &str) -> Decimal {
        self.totals.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    fn insert(&mut self, records: Vec<Volume>, log_skips: bool) -> bool {
        let mut changed = false;

        for record in records {
            if record.height == 0 {
                continue;
            }
            if self.contains(record.height) {
                if log_skips {
                    debug!(height = record.height, "height already recorded, skipping");
                }
                continue;
            }
            self.records.push(record);
            changed = true;
        }

        if !changed {
            return false;
        }

        self.records.sort_by_key(|r| r.height);

        // Window covers the head plus `depth` backfill heights.
        let cap = self.depth as usize + 1;
        if self.records.len() > cap {
            let excess = self.records.len() - cap;
            self.records.drain(..excess);
        }

        self.totals = self.zero_values();
        for record in &self.records {
            for (symbol, amount) in &record.values {
                *self.totals.entry(symbol.clone()).or_insert(Decimal::ZERO) += *amount;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn history(depth: u64) -> VolumeHistory {
        let pairs = vec![CurrencyPair::new("ATOM", "USDC")];
        VolumeHistory::new("test", &pairs, depth, Arc::new(MemoryVolumeStore::default())).unwrap()
    }

    fn record(history: &VolumeHistory, height: u64, traded: Decimal) -> Volume {
        let mut values = history.zero_values();
        values.insert("ATOMUSDC".into(), traded);
        Volume {
            height,
            time: 1_700_000_000 + height as i64,
            values,
        }
    }

    #[test]
    fn missing_on_empty_window_is_sentinel_only() {
        assert_eq!(history(4).missing(4), vec![0]);
    }

    #[test]
    fn missing_returns_depth_candidates_plus_sentinel() {
        let mut h = history(4);
        let head = record(&h, 100, dec!(1));
        h.add(vec![head]);

        assert_eq!(h.missing(4), vec![96, 97, 98, 99, 0]);
    }

    #[test]
    fn missing_never_returns_present_heights() {
        let mut h = history(4);
        h.add(vec![record(&h, 100, dec!(1)), record(&h, 98, dec!(2))]);

        assert_eq!(h.missing(4), vec![96, 97, 99, 0]);
    }

    #[test]
    fn add_skips_existing_heights_and_totals_unchanged() {
        let mut h = history(4);
        h.add(vec![record(&h, 100, dec!(5))]);
        assert_eq!(h.total("ATOMUSDC"), dec!(5));

        // Re-adding the same height must never double count.
        h.add(vec![record(&h, 100, dec!(99))]);
        assert_eq!(h.total("ATOMUSDC"), dec!(5));
    }

    #[test]
    fn untraded_symbol_totals_zero_not_absent() {
        let mut h = history(4);
        h.add(vec![record(&h, 100, dec!(5))]);

        assert_eq!(h.total("USDCATOM"), Decimal::ZERO);
        assert_eq!(h.total("UNKNOWN"), Decimal::ZERO);
    }

    #[test]
    fn both_directions_present_in_every_record() {
        let h = history(4);
        let values = h.zero_values();
        assert!(values.contains_key("ATOMUSDC"));
        assert!(values.contains_key("USDCATOM"));
    }

    #[test]
    fn window_prunes_to_depth_plus_head() {
        let mut h = history(2);
        h.add(vec![
            record(&h, 10, dec!(1)),
            record(&h, 11, dec!(2)),
            record(&h, 12, dec!(4)),
            record(&h, 13, dec!(8)),
        ]);

        // depth 2 keeps head + two backfill heights: 11, 12, 13.
        assert!(!h.contains(10));
        assert_eq!(h.total("ATOMUSDC"), dec!(14));
        assert_eq!(h.latest_height(), Some(13));
    }

    #[test]
    fn records_sorted_regardless_of_batch_order() {
        let mut h = history(4);
        h.add(vec![
            record(&h, 102, dec!(1)),
            record(&h, 100, dec!(1)),
            record(&h, 101, dec!(1)),
        ]);

        assert_eq!(h.latest_height(), Some(102));
        assert_eq!(h.missing(4), vec![98, 99, 0]);
    }
}
