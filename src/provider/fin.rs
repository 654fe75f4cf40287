//! FIN order-book provider
//!
//! Polls a Kujira node directly: best bid/ask from the fin contract's book
//! for the price, and per-block `wasm-trade` events for the rolling volume
//! window. Amounts on chain are integers scaled by per-asset decimals, so
//! everything stays in decimal arithmetic end to end.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::cache::TickerCache;
use super::registry::PairRegistry;
use super::{start_polling, Polling, Provider, ProviderHandle};
use crate::chain::{ChainApi, TxEvent};
use crate::config::Endpoint;
use crate::error::FeedError;
use crate::types::{parse_dec, pow10, scale_down, CurrencyPair, Ticker};
use crate::volume::{Volume, VolumeHistory, VolumeStore};

const BOOK_QUERY: &str = r#"{"book":{"limit":1}}"#;
const CONFIG_QUERY: &str = r#"{"config":{}}"#;
const TRADE_EVENT: &str = "wasm-trade";

/// Quotes wider than low * 1.1 come from thin or stale books.
const MAX_SPREAD: Decimal = dec!(1.1);

#[derive(Debug, Deserialize)]
struct BookResponse {
    data: BookData,
}

#[derive(Debug, Deserialize)]
struct BookData {
    base: Vec<BookOrder>,
    quote: Vec<BookOrder>,
}

#[derive(Debug, Deserialize)]
struct BookOrder {
    #[serde(rename = "quote_price")]
    price: String,
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    data: ContractConfig,
}

#[derive(Debug, Deserialize)]
struct ContractConfig {
    decimal_delta: i64,
}

/// Contract-specific exponent correction between the two sides' token
/// precisions.
fn apply_delta(price: Decimal, delta: i64) -> Decimal {
    if delta >= 0 {
        price * pow10(delta as u32)
    } else {
        price / pow10(delta.unsigned_abs() as u32)
    }
}

pub struct FinProvider {
    endpoint: Endpoint,
    registry: PairRegistry,
    cache: TickerCache,
    chain: Arc<dyn ChainApi>,
    volumes: Mutex<VolumeHistory>,
    /// Contract -> decimal delta, queried at most once per contract.
    deltas: Mutex<HashMap<String, i64>>,
}

impl FinProvider {
    pub fn new(
        endpoint: Endpoint,
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn VolumeStore>,
        pairs: &[CurrencyPair],
    ) -> anyhow::Result<Arc<Self>> {
        let registry = PairRegistry::new(&endpoint.contracts, pairs);

        let volumes = VolumeHistory::new(
            &endpoint.name,
            &registry.resolved_pairs(),
            endpoint.volume_blocks,
            store,
        )?;

        let cache = TickerCache::new();
        cache.register_symbols(registry.entries().map(|(symbol, _)| symbol.clone()));

        Ok(Arc::new(Self {
            endpoint,
            registry,
            cache,
            chain,
            volumes: Mutex::new(volumes),
            deltas: Mutex::new(HashMap::new()),
        }))
    }

    /// Spawn the fixed-interval poll loop as this provider's ingestion task.
    pub fn start(self: &Arc<Self>) -> ProviderHandle {
        start_polling(self.clone(), self.endpoint.poll_interval())
    }

    async fn refresh_volumes(&self) {
        let missing = {
            let volumes = self.volumes.lock().unwrap();
            volumes.missing(self.endpoint.volume_blocks)
        };

        let mut fetched = Vec::with_capacity(missing.len());
        for height in missing {
            match self.fetch_volume(height).await {
                Ok(Some(volume)) => fetched.push(volume),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        provider = %self.endpoint.name,
                        height,
                        error = %e,
                        "volume fetch failed"
                    );
                }
            }
            tokio::time::sleep(self.endpoint.volume_pause()).await;
        }

        self.volumes.lock().unwrap().add(fetched);
    }

    /// Reconstruct traded volume for one block height. Height `0` resolves
    /// to the current head; a height already accounted for yields `None` so
    /// it is never double counted.
    async fn fetch_volume(&self, height: u64) -> Result<Option<Volume>, FeedError> {
        let resolved = if height == 0 {
            self.chain.latest_height().await?
        } else {
            height
        };

        let mut values = {
            let volumes = self.volumes.lock().unwrap();
            if volumes.contains(resolved) {
                return Ok(None);
            }
            volumes.zero_values()
        };

        debug!(provider = %self.endpoint.name, height = resolved, "reconstructing volume");

        let (txs, block_time) = self.chain.txs_at(resolved, &[]).await?;

        for tx in &txs {
            for event in tx.events_by_type(TRADE_EVENT) {
                let Some(contract) = event.attributes.get("_contract_address") else {
                    continue;
                };
                let Some(symbol) = self.registry.symbol_for_contract(contract) else {
                    debug!(contract = %contract, "trade on unknown contract");
                    continue;
                };
                let Some(pair) = self.registry.provider_pair(symbol) else {
                    continue;
                };
                let pair = pair.clone();

                if let Err(e) = self.accumulate_trade(&pair, contract, event, &mut values).await {
                    warn!(symbol = %symbol, error = %e, "skipping trade event");
                }
            }
        }

        Ok(Some(Volume {
            height: resolved,
            time: block_time,
            values,
        }))
    }

    /// Fold one trade event into both directions of its pair's buckets.
    async fn accumulate_trade(
        &self,
        pair: &CurrencyPair,
        contract: &str,
        event: &TxEvent,
        values: &mut HashMap<String, Decimal>,
    ) -> Result<(), FeedError> {
        let base_amount = event
            .attributes
            .get("base_amount")
            .ok_or_else(|| FeedError::Parse("trade event without base_amount".into()))?;
        let quote_amount = event
            .attributes
            .get("quote_amount")
            .ok_or_else(|| FeedError::Parse("trade event without quote_amount".into()))?;

        let base_decimals = self.endpoint.decimals.get(&pair.base).copied();
        let quote_decimals = self.endpoint.decimals.get(&pair.quote).copied();

        // When one side's precision is unknown it is derived from the other
        // side plus the contract's decimal delta.
        let (base_decimals, quote_decimals) = match (base_decimals, quote_decimals) {
            (Some(base), Some(quote)) => (base, quote),
            (None, Some(quote)) => {
                let delta = self.decimal_delta(contract).await?;
                (quote + delta, quote)
            }
            (Some(base), None) => {
                let delta = self.decimal_delta(contract).await?;
                (base, base - delta)
            }
            (None, None) => {
                return Err(FeedError::Configuration(format!(
                    "no decimals known for {}",
                    pair.symbol()
                )));
            }
        };

        let base = scale_down(parse_dec(base_amount)?, base_decimals);
        let quote = scale_down(parse_dec(quote_amount)?, quote_decimals);

        for (bucket, amount) in [(pair.symbol(), base), (pair.swap().symbol(), quote)] {
            match values.get_mut(&bucket) {
                Some(value) => *value += amount,
                None => warn!(symbol = %bucket, "volume bucket not registered"),
            }
        }

        Ok(())
    }

    async fn decimal_delta(&self, contract: &str) -> Result<i64, FeedError> {
        if let Some(delta) = self.deltas.lock().unwrap().get(contract).copied() {
            return Ok(delta);
        }

        let content = self.chain.wasm_smart_query(contract, CONFIG_QUERY).await?;
        let response: ConfigResponse = serde_json::from_slice(&content)?;

        self.deltas
            .lock()
            .unwrap()
            .insert(contract.to_string(), response.data.decimal_delta);
        Ok(response.data.decimal_delta)
    }

    async fn update_pair(
        &self,
        symbol: &str,
        pair: &CurrencyPair,
        timestamp: i64,
    ) -> Result<(), FeedError> {
        let contract = self.registry.contract(pair)?;

        let content = self.chain.wasm_smart_query(&contract, BOOK_QUERY).await?;
        let book: BookResponse = serde_json::from_slice(&content)?;

        let (base, quote) = match (book.data.base.first(), book.data.quote.first()) {
            (Some(base), Some(quote)) => (parse_dec(&base.price)?, parse_dec(&quote.price)?),
            _ => {
                return Err(FeedError::InvalidPrice {
                    symbol: symbol.to_string(),
                    reason: "empty order book".into(),
                });
            }
        };

        // Lower side is low, regardless of which side it came from.
        let (low, high) = if base < quote {
            (base, quote)
        } else {
            (quote, base)
        };

        if high > low * MAX_SPREAD {
            let spread = (high - low) / low;
            return Err(FeedError::SpreadTooWide {
                symbol: symbol.to_string(),
                spread,
            });
        }

        let delta = self.decimal_delta(&contract).await?;
        let price = apply_delta((base + quote) / dec!(2), delta);
        if price <= Decimal::ZERO {
            return Err(FeedError::InvalidPrice {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {price}"),
            });
        }

        let volume = self.pair_volume(symbol, pair, price);

        self.cache.set_ticker(
            symbol,
            Ticker {
                price,
                volume,
                time: timestamp,
            },
        );
        Ok(())
    }

    fn pair_volume(&self, symbol: &str, pair: &CurrencyPair, price: Decimal) -> Decimal {
        let volumes = self.volumes.lock().unwrap();

        if self.registry.is_inverted(symbol) {
            // The windowed total is quote denominated; convert it with the
            // current cycle price. The trades themselves may have happened
            // at different prices.
            let volume = volumes.total(&pair.swap().symbol());
            if volume.is_zero() {
                volume
            } else {
                volume / price
            }
        } else {
            volumes.total(symbol)
        }
    }
}

#[async_trait]
impl Polling for FinProvider {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn poll(&self) -> Result<(), FeedError> {
        self.refresh_volumes().await;

        let timestamp = Utc::now().timestamp_millis();
        let entries: Vec<(String, CurrencyPair)> = self
            .registry
            .entries()
            .map(|(symbol, pair)| (symbol.clone(), pair.clone()))
            .collect();

        for (symbol, pair) in entries {
            if let Err(e) = self.update_pair(&symbol, &pair, timestamp).await {
                warn!(
                    provider = %self.endpoint.name,
                    symbol = %symbol,
                    error = %e,
                    "pair skipped this cycle"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Provider for FinProvider {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Ticker>, FeedError> {
        let mut tickers = HashMap::with_capacity(pairs.len());

        for pair in pairs {
            let symbol = pair.symbol();
            let ticker = self.cache.get(&symbol)?;
            tickers.insert(symbol, ticker);
        }

        Ok(tickers)
    }

    async fn get_available_pairs(&self) -> Result<std::collections::HashSet<String>, FeedError> {
        Ok(self.registry.available_pairs())
    }
}
