//! Bitfinex streaming provider
//!
//! Subscribes to ticker channels over the public multiplexed socket. The
//! upstream routes ticks by an opaque channel id assigned at
//! subscribe-acknowledgement time, so frames are demultiplexed through the
//! cache's channel map.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::cache::TickerCache;
use super::stream::{MessageHandler, StreamController};
use super::{Provider, ProviderHandle};
use crate::config::Endpoint;
use crate::error::FeedError;
use crate::types::{CurrencyPair, Ticker};

const BITFINEX_WS_HOST: &str = "api-pub.bitfinex.com";
const BITFINEX_WS_PATH: &str = "/ws/2";

/// Ticker frames are positional:
/// [bid, bid_size, ask, ask_size, change, change_rel, last, volume, high, low]
const FRAME_PRICE_IDX: usize = 6;
const FRAME_VOLUME_IDX: usize = 7;

#[derive(Debug, Deserialize)]
struct SubscriptionAck {
    event: String,
    #[serde(rename = "chanId")]
    channel_id: u64,
    pair: String,
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
}

/// Frame parser shared with the stream controller's read loop.
struct BitfinexFeed {
    cache: Arc<TickerCache>,
}

impl BitfinexFeed {
    fn dec_at(data: &[Value], idx: usize) -> Option<rust_decimal::Decimal> {
        match data.get(idx)? {
            // Going through the number's string form keeps the full printed
            // precision out of the float representation.
            Value::Number(n) => n.to_string().parse().ok(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn set_ticker(&self, channel: u64, data: &[Value]) -> bool {
        if data.len() <= FRAME_VOLUME_IDX {
            return false;
        }

        let price = Self::dec_at(data, FRAME_PRICE_IDX);
        let volume = Self::dec_at(data, FRAME_VOLUME_IDX);

        match (price, volume) {
            (Some(price), Some(volume)) => {
                self.cache.set_ticker_for_channel(
                    channel,
                    Ticker {
                        price,
                        volume,
                        time: Utc::now().timestamp_millis(),
                    },
                );
                true
            }
            _ => false,
        }
    }
}

impl MessageHandler for BitfinexFeed {
    fn message_received(&self, frame: &[u8]) {
        // Acks first: their object shape must not be mistaken for the
        // array framing below.
        if let Ok(ack) = serde_json::from_slice::<SubscriptionAck>(frame) {
            if ack.event == "subscribed" {
                self.cache.set_channel(&ack.pair, ack.channel_id);
                return;
            }
        }

        if let Ok(event) = serde_json::from_slice::<EventFrame>(frame) {
            debug!(event = %event.event, "ignoring event frame");
            return;
        }

        if let Ok((channel, payload)) = serde_json::from_slice::<(u64, Value)>(frame) {
            match payload {
                Value::String(flag) if flag == "hb" => return,
                Value::Array(data) => {
                    if self.set_ticker(channel, &data) {
                        return;
                    }
                }
                _ => {}
            }
        }

        warn!(length = frame.len(), "unhandled stream frame");
    }
}

pub struct BitfinexProvider {
    cache: Arc<TickerCache>,
    subscribed: Mutex<HashMap<String, CurrencyPair>>,
    controller: Arc<StreamController>,
}

impl BitfinexProvider {
    pub fn new(endpoint: &Endpoint, pairs: &[CurrencyPair]) -> Self {
        let host = if endpoint.websocket.is_empty() {
            BITFINEX_WS_HOST
        } else {
            endpoint.websocket.as_str()
        };
        let url = format!("wss://{host}{BITFINEX_WS_PATH}");

        Self::with_url(endpoint, pairs, url)
    }

    /// Same as `new` but against an explicit socket URL; used by tests to
    /// point at a local server.
    pub fn with_url(endpoint: &Endpoint, pairs: &[CurrencyPair], url: String) -> Self {
        let cache = Arc::new(TickerCache::new());
        let handler = Arc::new(BitfinexFeed {
            cache: cache.clone(),
        });

        let subscribed: HashMap<String, CurrencyPair> = pairs
            .iter()
            .map(|cp| (cp.symbol(), cp.clone()))
            .collect();

        let controller = Arc::new(StreamController::new(
            "bitfinex",
            url,
            Self::subscription_msgs(pairs),
            handler,
            endpoint.ping_timeout(),
        ));

        Self {
            cache,
            subscribed: Mutex::new(subscribed),
            controller,
        }
    }

    /// Spawn the socket loop as this provider's ingestion task.
    pub fn start(&self) -> ProviderHandle {
        let controller = self.controller.clone();
        ProviderHandle::spawn(move |shutdown| async move { controller.run(shutdown).await })
    }

    fn subscription_msgs(pairs: &[CurrencyPair]) -> Vec<Value> {
        pairs
            .iter()
            .map(|cp| {
                serde_json::json!({
                    "event": "subscribe",
                    "channel": "ticker",
                    "symbol": format!("t{}", cp.symbol()),
                })
            })
            .collect()
    }

    #[cfg(test)]
    fn feed(&self) -> BitfinexFeed {
        BitfinexFeed {
            cache: self.cache.clone(),
        }
    }
}

#[async_trait]
impl Provider for BitfinexProvider {
    fn name(&self) -> &str {
        "bitfinex"
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
        Ok(self.subscribed.lock().unwrap().keys().cloned().collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<(), FeedError> {
        let mut subscribed = self.subscribed.lock().unwrap();

        let new_pairs: Vec<CurrencyPair> = pairs
            .iter()
            .filter(|cp| !subscribed.contains_key(&cp.symbol()))
            .cloned()
            .collect();
        if new_pairs.is_empty() {
            return Ok(());
        }

        self.controller
            .add_subscription_msgs(Self::subscription_msgs(&new_pairs))?;

        for pair in new_pairs {
            subscribed.insert(pair.symbol(), pair);
        }
        Ok(())
    }
}
