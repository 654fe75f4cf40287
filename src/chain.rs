//! Chain query client
//!
//! Abstracts the node-facing transport: plain GETs, CosmWasm smart queries,
//! current height and decoded transactions for a height. Providers only see
//! this trait, so tests can substitute a mock.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::DateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::error::FeedError;

#[cfg(test)]
use mockall::automock;

/// One decoded event emitted by a transaction.
#[derive(Debug, Clone, Default)]
pub struct TxEvent {
    pub kind: String,
    pub attributes: HashMap<String, String>,
}

/// A decoded transaction with its events.
#[derive(Debug, Clone, Default)]
pub struct ChainTx {
    pub hash: String,
    pub events: Vec<TxEvent>,
}

impl ChainTx {
    /// All events of the given type, across every message log.
    pub fn events_by_type(&self, kind: &str) -> Vec<&TxEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }
}

/// Node-facing query surface consumed by polling providers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Perform a GET against the configured REST endpoints, returning the
    /// raw body.
    async fn http_get(&self, path: &str) -> Result<Vec<u8>, FeedError>;

    /// CosmWasm smart query against a contract, returning the raw response
    /// body (callers parse the `data` wrapper).
    async fn wasm_smart_query(&self, contract: &str, query: &str) -> Result<Vec<u8>, FeedError>;

    /// Current chain height.
    async fn latest_height(&self) -> Result<u64, FeedError>;

    /// Decoded transactions at a height plus the block timestamp (unix
    /// seconds). An empty `msg_filter` returns all transactions; otherwise
    /// only transactions carrying at least one message of a listed type.
    async fn txs_at(
        &self,
        height: u64,
        msg_filter: &[String],
    ) -> Result<(Vec<ChainTx>, i64), FeedError>;
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    block: Block,
}

#[derive(Debug, Deserialize)]
struct Block {
    header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    height: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct TxsResponse {
    #[serde(default)]
    txs: Vec<TxBody>,
    #[serde(default)]
    tx_responses: Vec<TxResponse>,
}

#[derive(Debug, Deserialize)]
struct TxBody {
    body: TxMessages,
}

#[derive(Debug, Deserialize)]
struct TxMessages {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    txhash: String,
    #[serde(default)]
    logs: Vec<TxLog>,
}

#[derive(Debug, Deserialize)]
struct TxLog {
    #[serde(default)]
    events: Vec<LogEvent>,
}

#[derive(Debug, Deserialize)]
struct LogEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Vec<LogAttribute>,
}

#[derive(Debug, Deserialize)]
struct LogAttribute {
    key: String,
    #[serde(default)]
    value: String,
}

/// LCD-backed implementation. Multiple base URLs are tried in order; the
/// first success wins.
pub struct HttpChainApi {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl HttpChainApi {
    pub fn new(endpoint: &Endpoint) -> Result<Self, FeedError> {
        if endpoint.urls.is_empty() {
            return Err(FeedError::Configuration(format!(
                "provider {} has no REST urls",
                endpoint.name
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            urls: endpoint.urls.clone(),
        })
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        let mut last_err = None;

        for url in &self.urls {
            let full = format!("{}{}", url.trim_end_matches('/'), path);
            match self.client.get(&full).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.bytes().await?.to_vec());
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "node returned error status");
                    last_err = Some(FeedError::Transport(format!(
                        "{full} returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "node request failed");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FeedError::Transport("no urls configured".into())))
    }
}

#[async_trait]
impl ChainApi for HttpChainApi {
    async fn http_get(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        self.get_bytes(path).await
    }

    async fn wasm_smart_query(&self, contract: &str, query: &str) -> Result<Vec<u8>, FeedError> {
        let encoded = BASE64.encode(query.as_bytes());
        let path = format!("/cosmwasm/wasm/v1/contract/{contract}/smart/{encoded}");
        self.get_bytes(&path).await
    }

    async fn latest_height(&self) -> Result<u64, FeedError> {
        let body = self
            .get_bytes("/cosmos/base/tendermint/v1beta1/blocks/latest")
            .await?;
        let response: BlockResponse = serde_json::from_slice(&body)?;

        response
            .block
            .header
            .height
            .parse()
            .map_err(|e| FeedError::Parse(format!("invalid block height: {e}")))
    }

    async fn txs_at(
        &self,
        height: u64,
        msg_filter: &[String],
    ) -> Result<(Vec<ChainTx>, i64), FeedError> {
        let body = self
            .get_bytes(&format!("/cosmos/base/tendermint/v1beta1/blocks/{height}"))
            .await?;
        let block: BlockResponse = serde_json::from_slice(&body)?;
        let timestamp = DateTime::parse_from_rfc3339(&block.block.header.time)
            .map_err(|e| FeedError::Parse(format!("invalid block time: {e}")))?
            .timestamp();

        let body = self
            .get_bytes(&format!(
                "/cosmos/tx/v1beta1/txs?events=tx.height%3D{height}&pagination.limit=100"
            ))
            .await?;
        let response: TxsResponse = serde_json::from_slice(&body)?;

        let mut txs = Vec::new();
        for (tx, tx_response) in response.txs.iter().zip(response.tx_responses.iter()) {
            if !msg_filter.is_empty() {
                let wanted = tx.body.messages.iter().any(|msg| {
                    msg.get("@type")
                        .and_then(|t| t.as_str())
                        .map(|t| msg_filter.iter().any(|f| f == t))
                        .unwrap_or(false)
                });
                if !wanted {
                    continue;
                }
            }

            let events = tx_response
                .logs
                .iter()
                .flat_map(|log| &log.events)
                .map(|event| TxEvent {
                    kind: event.kind.clone(),
                    attributes: event
                        .attributes
                        .iter()
                        .map(|a| (a.key.clone(), a.value.clone()))
                        .collect(),
                })
                .collect();

            txs.push(ChainTx {
                hash: tx_response.txhash.clone(),
                events,
            });
        }

        debug!(height, txs = txs.len(), "fetched transactions");
        Ok((txs, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_by_type_filters() {
        let tx = ChainTx {
            hash: "AB12".into(),
            events: vec![
                TxEvent {
                    kind: "wasm-trade".into(),
                    attributes: HashMap::new(),
                },
                TxEvent {
                    kind: "transfer".into(),
                    attributes: HashMap::new(),
                },
                TxEvent {
                    kind: "wasm-trade".into(),
                    attributes: HashMap::new(),
                },
            ],
        };

        assert_eq!(tx.events_by_type("wasm-trade").len(), 2);
        assert_eq!(tx.events_by_type("token_swapped").len(), 0);
    }
}
