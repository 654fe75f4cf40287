//! Concurrency-safe last-value ticker store
//!
//! Written by one ingestion task, read by external query calls. A single
//! coarse lock guards the maps; it is only ever held across in-memory
//! operations, never across network I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::FeedError;
use crate::types::Ticker;

#[derive(Default)]
struct CacheInner {
    /// Symbols a polling provider serves; registered at construction.
    known: HashSet<String>,
    /// Symbol -> upstream-assigned channel id, populated as subscription
    /// acks arrive.
    channels: HashMap<String, u64>,
    /// Ticks routed by channel id. A tick for a channel id with no symbol
    /// mapping stays here, unusable, until the mapping resolves.
    by_channel: HashMap<u64, Ticker>,
    /// Tickers published by polling providers, keyed by symbol.
    by_symbol: HashMap<String, Ticker>,
}

#[derive(Default)]
pub struct TickerCache {
    inner: Mutex<CacheInner>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare symbols a polling provider will publish. Until the first
    /// publish they read as `NoData` rather than `NotSubscribed`.
    pub fn register_symbols<I: IntoIterator<Item = String>>(&self, symbols: I) {
        let mut inner = self.inner.lock().unwrap();
        inner.known.extend(symbols);
    }

    /// Record a subscription-ack channel assignment for a symbol.
    pub fn set_channel(&self, symbol: &str, channel: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.insert(symbol.to_string(), channel);
    }

    /// Store a tick routed by channel id. Always replaces, never merges.
    pub fn set_ticker_for_channel(&self, channel: u64, ticker: Ticker) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_channel.insert(channel, ticker);
    }

    /// Store a polled ticker by symbol. Always replaces, never merges.
    pub fn set_ticker(&self, symbol: &str, ticker: Ticker) {
        let mut inner = self.inner.lock().unwrap();
        inner.known.insert(symbol.to_string());
        inner.by_symbol.insert(symbol.to_string(), ticker);
    }

    /// Last observation for a symbol.
    ///
    /// `NotSubscribed` when no channel or mapping exists for the symbol,
    /// `NoData` when a mapping exists but nothing has landed yet. Never
    /// blocks on network I/O.
    pub fn get(&self, symbol: &str) -> Result<Ticker, FeedError> {
        let inner = self.inner.lock().unwrap();

        if let Some(channel) = inner.channels.get(symbol) {
            return inner
                .by_channel
                .get(channel)
                .cloned()
                .ok_or_else(|| FeedError::NoData {
                    symbol: symbol.to_string(),
                });
        }

        if inner.known.contains(symbol) {
            return inner
                .by_symbol
                .get(symbol)
                .cloned()
                .ok_or_else(|| FeedError::NoData {
                    symbol: symbol.to_string(),
                });
        }

        Err(FeedError::NotSubscribed {
            symbol: symbol.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(price: rust_decimal::Decimal) -> Ticker {
        Ticker {
            price,
            volume: dec!(1),
            time: 1_700_000_000_000,
        }
    }

    #[test]
    fn unknown_symbol_is_not_subscribed() {
        let cache = TickerCache::new();
        assert!(matches!(
            cache.get("ATOMUSDC"),
            Err(FeedError::NotSubscribed { .. })
        ));
    }

    #[test]
    fn mapped_channel_without_tick_is_no_data() {
        let cache = TickerCache::new();
        cache.set_channel("ATOMUSDC", 17);
        assert!(matches!(
            cache.get("ATOMUSDC"),
            Err(FeedError::NoData { .. })
        ));
    }

    #[test]
    fn registered_symbol_without_publish_is_no_data() {
        let cache = TickerCache::new();
        cache.register_symbols(["ATOMUSDC".to_string()]);
        assert!(matches!(
            cache.get("ATOMUSDC"),
            Err(FeedError::NoData { .. })
        ));
    }

    #[test]
    fn tick_before_mapping_becomes_readable_once_acked() {
        let cache = TickerCache::new();

        // Tick lands on a channel id nothing maps to yet.
        cache.set_ticker_for_channel(17, ticker(dec!(9.5)));
        assert!(matches!(
            cache.get("ATOMUSDC"),
            Err(FeedError::NotSubscribed { .. })
        ));

        // Once the ack resolves the mapping, the earlier tick is attributed.
        cache.set_channel("ATOMUSDC", 17);
        assert_eq!(cache.get("ATOMUSDC").unwrap().price, dec!(9.5));
    }

    #[test]
    fn set_replaces_whole_value() {
        let cache = TickerCache::new();
        cache.set_ticker("ATOMUSDC", ticker(dec!(1)));
        cache.set_ticker(
            "ATOMUSDC",
            Ticker {
                price: dec!(2),
                volume: dec!(3),
                time: 5,
            },
        );

        let t = cache.get("ATOMUSDC").unwrap();
        assert_eq!(t.price, dec!(2));
        assert_eq!(t.volume, dec!(3));
        assert_eq!(t.time, 5);
    }

    #[test]
    fn concurrent_reads_never_see_torn_tickers() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(TickerCache::new());
        cache.set_ticker("ATOMUSDC", ticker(dec!(1)));

        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 1..2_000i64 {
                    let value = rust_decimal::Decimal::from(i);
                    cache.set_ticker(
                        "ATOMUSDC",
                        Ticker {
                            price: value,
                            volume: value,
                            time: i,
                        },
                    );
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let t = cache.get("ATOMUSDC").unwrap();
                        // Price and volume always come from one observation.
                        assert_eq!(t.price, t.volume);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
