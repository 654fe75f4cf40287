//! Osmosis pool provider
//!
//! Prices come straight from on-chain pool state: spot-price queries for
//! weighted/stableswap pools, the stored square-root price for concentrated
//! liquidity. Volume is reconstructed from `token_swapped` events of
//! swap-bearing transactions.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::cache::TickerCache;
use super::registry::PairRegistry;
use super::{start_polling, Polling, Provider, ProviderHandle};
use crate::chain::{ChainApi, TxEvent};
use crate::config::Endpoint;
use crate::error::FeedError;
use crate::types::{parse_dec, parse_denom, scale_down, CurrencyPair, Denom, Ticker};
use crate::volume::{Volume, VolumeHistory, VolumeStore};

const POOL_TYPE_WEIGHTED: &str = "/osmosis.gamm.v1beta1.Pool";
const POOL_TYPE_STABLESWAP: &str = "/osmosis.gamm.poolmodels.stableswap.v1beta1.Pool";
const POOL_TYPE_CONCENTRATED: &str = "/osmosis.concentratedliquidity.v1beta1.Pool";

const SWAP_EVENT: &str = "token_swapped";

/// Only these message types can carry swaps; everything else is skipped at
/// the node.
const SWAP_MSG_TYPES: [&str; 5] = [
    "/osmosis.poolmanager.v1beta1.MsgSwapExactAmountIn",
    "/osmosis.gamm.v1beta1.MsgSwapExactAmountIn",
    "/cosmwasm.wasm.v1.MsgExecuteContract",
    "/ibc.core.channel.v1.MsgRecvPacket",
    "/osmosis.poolmanager.v1beta1.MsgSplitRouteSwapExactAmountIn",
];

#[derive(Debug, Deserialize)]
struct PoolResponse {
    pool: Pool,
}

#[derive(Debug, Deserialize)]
struct Pool {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(default)]
    pool_assets: Vec<PoolAsset>,
    #[serde(default)]
    pool_liquidity: Vec<PoolToken>,
    #[serde(default)]
    token0: String,
    #[serde(default)]
    token1: String,
    #[serde(default, rename = "current_sqrt_price")]
    sqrt_price: String,
}

#[derive(Debug, Deserialize)]
struct PoolAsset {
    token: PoolToken,
}

#[derive(Debug, Deserialize, Default)]
struct PoolToken {
    denom: String,
}

#[derive(Debug, Deserialize)]
struct SpotPriceResponse {
    spot_price: String,
}

pub struct OsmosisProvider {
    endpoint: Endpoint,
    registry: PairRegistry,
    cache: TickerCache,
    chain: Arc<dyn ChainApi>,
    volumes: Mutex<VolumeHistory>,
    /// symbol <-> on-chain denom, both directions.
    denoms: HashMap<String, String>,
    /// Pool ids priced via their stored square-root price.
    concentrated: HashSet<String>,
}

impl OsmosisProvider {
    pub async fn new(
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

        let (denoms, concentrated) = Self::inspect_pools(&endpoint, &registry, chain.as_ref()).await;

        Ok(Arc::new(Self {
            endpoint,
            registry,
            cache,
            chain,
            volumes: Mutex::new(volumes),
            denoms,
            concentrated,
        }))
    }

    /// Spawn the fixed-interval poll loop as this provider's ingestion task.
    pub fn start(self: &Arc<Self>) -> ProviderHandle {
        start_polling(self.clone(), self.endpoint.poll_interval())
    }

    /// Query each configured pool once to learn its type and denoms. A pair
    /// whose pool is unreachable or of an unsupported type is left
    /// unresolved and skipped until configuration changes.
    async fn inspect_pools(
        endpoint: &Endpoint,
        registry: &PairRegistry,
        chain: &dyn ChainApi,
    ) -> (HashMap<String, String>, HashSet<String>) {
        let mut denoms = HashMap::new();
        let mut concentrated = HashSet::new();

        for (symbol, pair) in registry.entries() {
            let pool = match registry.contract(pair) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(provider = %endpoint.name, symbol = %symbol, error = %e, "no pool id");
                    continue;
                }
            };

            let pair = if registry.is_inverted(symbol) {
                pair.swap()
            } else {
                pair.clone()
            };

            let response = match Self::query_pool(chain, &pool).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(provider = %endpoint.name, symbol = %symbol, error = %e, "pool query failed");
                    continue;
                }
            };

            let tokens = match response.pool.kind.as_str() {
                POOL_TYPE_WEIGHTED => {
                    let mut assets = response.pool.pool_assets.into_iter();
                    assets.next().zip(assets.next()).map(|(first, second)| {
                        (first.token.denom, second.token.denom)
                    })
                }
                POOL_TYPE_STABLESWAP => {
                    let mut liquidity = response.pool.pool_liquidity.into_iter();
                    liquidity
                        .next()
                        .zip(liquidity.next())
                        .map(|(first, second)| (first.denom, second.denom))
                }
                POOL_TYPE_CONCENTRATED => {
                    concentrated.insert(pool.clone());
                    Some((response.pool.token0, response.pool.token1))
                }
                other => {
                    warn!(
                        provider = %endpoint.name,
                        symbol = %symbol,
                        pool_type = %other,
                        "unsupported pool type, pair skipped"
                    );
                    continue;
                }
            };

            let Some((token0, token1)) = tokens else {
                warn!(provider = %endpoint.name, symbol = %symbol, "pool is missing assets");
                continue;
            };

            denoms.insert(pair.base.clone(), token0.clone());
            denoms.insert(token0, pair.base.clone());
            denoms.insert(pair.quote.clone(), token1.clone());
            denoms.insert(token1, pair.quote.clone());
        }

        (denoms, concentrated)
    }

    async fn query_pool(chain: &dyn ChainApi, pool: &str) -> Result<PoolResponse, FeedError> {
        let content = chain
            .http_get(&format!("/osmosis/gamm/v1beta1/pools/{pool}"))
            .await?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn query_spot(&self, pair: &CurrencyPair, pool: &str) -> Result<Decimal, FeedError> {
        let base = self.denoms.get(&pair.base).ok_or_else(|| {
            FeedError::Configuration(format!("no denom resolved for {}", pair.base))
        })?;
        let quote = self.denoms.get(&pair.quote).ok_or_else(|| {
            FeedError::Configuration(format!("no denom resolved for {}", pair.quote))
        })?;

        // The upstream flips base and quote in this query.
        let path = format!(
            "/osmosis/gamm/v1beta1/pools/{pool}/prices?base_asset_denom={}&quote_asset_denom={}",
            encode_denom(quote),
            encode_denom(base),
        );

        let content = self.chain.http_get(&path).await?;
        let response: SpotPriceResponse = serde_json::from_slice(&content)?;
        parse_dec(&response.spot_price)
    }

    /// Concentrated pools store a square-root price; the pair price is its
    /// square.
    async fn query_concentrated(&self, symbol: &str, pool: &str) -> Result<Decimal, FeedError> {
        let response = Self::query_pool(self.chain.as_ref(), pool).await?;

        let sqrt_price =
            parse_dec(&response.pool.sqrt_price).map_err(|_| FeedError::InvalidPrice {
                symbol: symbol.to_string(),
                reason: format!("unparsable sqrt price {:?}", response.pool.sqrt_price),
            })?;

        Ok(sqrt_price * sqrt_price)
    }

    async fn update_pair(
        &self,
        symbol: &str,
        pair: &CurrencyPair,
        timestamp: i64,
    ) -> Result<(), FeedError> {
        let pool = self.registry.contract(pair)?;

        let inverted = self.registry.is_inverted(symbol);
        let query_pair = if inverted { pair.swap() } else { pair.clone() };

        let price = if self.concentrated.contains(&pool) {
            self.query_concentrated(symbol, &pool).await?
        } else {
            self.query_spot(&query_pair, &pool).await?
        };

        if price <= Decimal::ZERO {
            return Err(FeedError::InvalidPrice {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {price}"),
            });
        }

        let volume = {
            let volumes = self.volumes.lock().unwrap();
            let total = volumes.total(&query_pair.symbol());
            if inverted && !total.is_zero() {
                // Quote-denominated total converted with the current cycle
                // price, not the price at trade time.
                total / price
            } else {
                total
            }
        };

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

        let filter: Vec<String> = SWAP_MSG_TYPES.iter().map(|s| s.to_string()).collect();
        let (txs, block_time) = self.chain.txs_at(resolved, &filter).await?;

        for tx in &txs {
            let swaps = tx.events_by_type(SWAP_EVENT);
            if swaps.is_empty() {
                continue;
            }
            debug!(tx = %tx.hash, swaps = swaps.len(), "swaps found");

            for event in swaps {
                let Some(pool) = event.attributes.get("pool_id") else {
                    continue;
                };
                let Some(symbol) = self.registry.symbol_for_contract(pool) else {
                    debug!(pool_id = %pool, "swap on unknown pool");
                    continue;
                };
                if !values.contains_key(symbol) {
                    debug!(symbol = %symbol, "swap for unregistered symbol");
                    continue;
                }

                let token_in = match self.resolve_token(event, "tokens_in") {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "failed parsing tokens_in");
                        continue;
                    }
                };
                let token_out = match self.resolve_token(event, "tokens_out") {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "failed parsing tokens_out");
                        continue;
                    }
                };

                let buckets = [
                    (
                        format!("{}{}", token_in.symbol, token_out.symbol),
                        token_in.amount,
                    ),
                    (
                        format!("{}{}", token_out.symbol, token_in.symbol),
                        token_out.amount,
                    ),
                ];
                for (bucket, amount) in buckets {
                    match values.get_mut(&bucket) {
                        Some(value) => *value += amount,
                        None => warn!(symbol = %bucket, "volume bucket not registered"),
                    }
                }
            }
        }

        Ok(Some(Volume {
            height: resolved,
            time: block_time,
            values,
        }))
    }

    fn resolve_token(&self, event: &TxEvent, key: &str) -> Result<Denom, FeedError> {
        let token = event
            .attributes
            .get(key)
            .ok_or_else(|| FeedError::Parse(format!("swap event without {key}")))?;

        let (amount, denom) = parse_denom(token)?;

        let symbol = self
            .denoms
            .get(&denom)
            .ok_or_else(|| FeedError::Configuration(format!("no symbol for denom {denom}")))?;

        let decimals = self
            .endpoint
            .decimals
            .get(symbol)
            .copied()
            .ok_or_else(|| FeedError::Configuration(format!("no decimals for {symbol}")))?;

        Ok(Denom {
            symbol: symbol.clone(),
            amount: scale_down(amount, decimals),
        })
    }
}

fn encode_denom(denom: &str) -> String {
    denom.replacen('/', "%2F", 1)
}

#[async_trait]
impl Polling for OsmosisProvider {
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
impl Provider for OsmosisProvider {
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

    async fn get_available_pairs(&self) -> Result<HashSet<String>, FeedError> {
        Ok(self.registry.available_pairs())
    }
}
