//! Pair resolution against a provider's contract table
//!
//! Maps provider-local symbols to canonical pairs, tracks which requested
//! pairs the upstream quotes in swapped orientation, and resolves
//! contract/pool identifiers both ways. Pure data, no I/O.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::error::FeedError;
use crate::types::CurrencyPair;

pub struct PairRegistry {
    /// Canonical requested symbol -> requested pair. Only pairs the contract
    /// table can actually serve.
    pairs: HashMap<String, CurrencyPair>,
    /// Requested symbols whose upstream quoting direction is swapped.
    inverted: HashSet<String>,
    /// Configured symbol (upstream orientation) -> pair in that orientation.
    provider_pairs: HashMap<String, CurrencyPair>,
    /// symbol -> contract id and contract id -> symbol.
    contracts: HashMap<String, String>,
    /// Symbols as configured in the contract table.
    configured: HashSet<String>,
}

impl PairRegistry {
    /// Resolve the requested pairs against the endpoint's contract table.
    /// A pair with neither orientation configured is dropped with a warning
    /// and stays unavailable until configuration changes.
    pub fn new(contracts: &HashMap<String, String>, requested: &[CurrencyPair]) -> Self {
        let mut table = HashMap::new();
        for (symbol, contract) in contracts {
            table.insert(symbol.clone(), contract.clone());
            table.insert(contract.clone(), symbol.clone());
        }

        let mut pairs = HashMap::new();
        let mut inverted = HashSet::new();
        let mut provider_pairs = HashMap::new();

        for pair in requested {
            let symbol = pair.symbol();
            let swapped = pair.swap();

            if contracts.contains_key(&symbol) {
                provider_pairs.insert(symbol.clone(), pair.clone());
                pairs.insert(symbol, pair.clone());
            } else if contracts.contains_key(&swapped.symbol()) {
                inverted.insert(symbol.clone());
                provider_pairs.insert(swapped.symbol(), swapped);
                pairs.insert(symbol, pair.clone());
            } else {
                warn!(symbol = %symbol, "no contract configured for pair, skipping");
            }
        }

        Self {
            pairs,
            inverted,
            provider_pairs,
            contracts: table,
            configured: contracts.keys().cloned().collect(),
        }
    }

    /// Canonical symbol -> requested pair, for the publish loop.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &CurrencyPair)> {
        self.pairs.iter()
    }

    /// The pairs resolved for this provider, in requested orientation.
    pub fn resolved_pairs(&self) -> Vec<CurrencyPair> {
        self.pairs.values().cloned().collect()
    }

    pub fn is_inverted(&self, symbol: &str) -> bool {
        self.inverted.contains(symbol)
    }

    /// Contract/pool id for a pair, trying both orientations.
    pub fn contract(&self, pair: &CurrencyPair) -> Result<String, FeedError> {
        self.contracts
            .get(&pair.symbol())
            .or_else(|| self.contracts.get(&pair.swap().symbol()))
            .cloned()
            .ok_or_else(|| {
                FeedError::Configuration(format!("no contract address for {}", pair.symbol()))
            })
    }

    /// Configured symbol for a contract id observed in a trade event.
    pub fn symbol_for_contract(&self, contract: &str) -> Option<&String> {
        self.contracts.get(contract)
    }

    /// Pair in upstream orientation for a configured symbol; trade event
    /// amounts are expressed in this orientation.
    pub fn provider_pair(&self, symbol: &str) -> Option<&CurrencyPair> {
        self.provider_pairs.get(symbol)
    }

    /// Pair strings the contract table can serve.
    pub fn available_pairs(&self) -> HashSet<String> {
        self.configured.clone()
    }
}
