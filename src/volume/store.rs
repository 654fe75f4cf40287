//! Volume window persistence
//!
//! The window survives process restarts through an abstract store keyed by
//! provider name. The CSV implementation mirrors the data-dir layout used
//! for the rest of the system's flat-file records; the in-memory store is
//! for tests.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

use super::Volume;

pub trait VolumeStore: Send + Sync {
    /// Load the persisted window for a provider, restricted to the given
    /// symbols. Symbols absent from storage come back as explicit zeros.
    fn load(&self, provider: &str, symbols: &[String]) -> anyhow::Result<Vec<Volume>>;

    /// Replace the persisted window for a provider.
    fn save(&self, provider: &str, records: &[Volume]) -> anyhow::Result<()>;
}

/// One row per (height, symbol) amount.
#[derive(Debug, Serialize, Deserialize)]
struct VolumeRow {
    height: u64,
    time: i64,
    symbol: String,
    amount: Decimal,
}

/// Flat-file CSV store, one file per provider under the data dir.
pub struct CsvVolumeStore {
    dir: PathBuf,
}

impl CsvVolumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_path(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{provider}_volumes.csv"))
    }
}

impl VolumeStore for CsvVolumeStore {
    fn load(&self, provider: &str, symbols: &[String]) -> anyhow::Result<Vec<Volume>> {
        let path = self.file_path(provider);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&path)?;
        let mut by_height: BTreeMap<u64, Volume> = BTreeMap::new();

        for row in reader.deserialize() {
            let row: VolumeRow = row?;
            if !symbols.contains(&row.symbol) {
                continue;
            }

            let record = by_height.entry(row.height).or_insert_with(|| Volume {
                height: row.height,
                time: row.time,
                values: symbols
                    .iter()
                    .map(|s| (s.clone(), Decimal::ZERO))
                    .collect::<HashMap<_, _>>(),
            });
            record.values.insert(row.symbol, row.amount);
        }

        let records: Vec<Volume> = by_height.into_values().collect();
        info!(provider, records = records.len(), "loaded volume window");
        Ok(records)
    }

    fn save(&self, provider: &str, records: &[Volume]) -> anyhow::Result<()> {
        let path = self.file_path(provider);
        let mut writer = csv::Writer::from_path(&path)?;

        for record in records {
            for (symbol, amount) in &record.values {
                writer.serialize(VolumeRow {
                    height: record.height,
                    time: record.time,
                    symbol: symbol.clone(),
                    amount: *amount,
                })?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// In-memory store for tests and volume-less deployments.
#[derive(Default)]
pub struct MemoryVolumeStore {
    inner: Mutex<HashMap<String, Vec<Volume>>>,
}

impl VolumeStore for MemoryVolumeStore {
    fn load(&self, provider: &str, _symbols: &[String]) -> anyhow::Result<Vec<Volume>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(provider).cloned().unwrap_or_default())
    }

    fn save(&self, provider: &str, records: &[Volume]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(provider.to_string(), records.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn csv_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("marketfeed-store-{}", std::process::id()));
        let store = CsvVolumeStore::new(&dir).unwrap();
        let symbols = vec!["ATOMUSDC".to_string(), "USDCATOM".to_string()];

        let mut values = HashMap::new();
        values.insert("ATOMUSDC".to_string(), dec!(12.5));
        values.insert("USDCATOM".to_string(), dec!(100));
        let records = vec![Volume {
            height: 42,
            time: 1_700_000_000,
            values,
        }];

        store.save("fin", &records).unwrap();
        let loaded = store.load("fin", &symbols).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].height, 42);
        assert_eq!(loaded[0].time, 1_700_000_000);
        assert_eq!(loaded[0].values["ATOMUSDC"], dec!(12.5));
        assert_eq!(loaded[0].values["USDCATOM"], dec!(100));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn csv_store_load_missing_file_is_empty() {
        let dir = std::env::temp_dir().join(format!("marketfeed-empty-{}", std::process::id()));
        let store = CsvVolumeStore::new(&dir).unwrap();

        assert!(store.load("nobody", &[]).unwrap().is_empty());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn csv_store_load_filters_unknown_symbols() {
        let dir = std::env::temp_dir().join(format!("marketfeed-filter-{}", std::process::id()));
        let store = CsvVolumeStore::new(&dir).unwrap();

        let mut values = HashMap::new();
        values.insert("ATOMUSDC".to_string(), dec!(1));
        values.insert("OSMOATOM".to_string(), dec!(7));
        store
            .save(
                "fin",
                &[Volume {
                    height: 7,
                    time: 0,
                    values,
                }],
            )
            .unwrap();

        let loaded = store.load("fin", &["ATOMUSDC".to_string()]).unwrap();
        assert_eq!(loaded[0].values.len(), 1);
        assert!(!loaded[0].values.contains_key("OSMOATOM"));

        fs::remove_dir_all(&dir).ok();
    }
}
