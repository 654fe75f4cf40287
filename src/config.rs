//! Configuration for MarketFeed providers
//!
//! Loads from a YAML file + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_poll_interval_ms() -> u64 {
    4_000
}

fn default_ping_timeout_ms() -> u64 {
    30_000
}

/// Per-provider endpoint configuration. Immutable after provider
/// construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    /// Provider name used for logging and persistence keys.
    pub name: String,
    /// REST base URLs, tried in order on transport failure.
    #[serde(default)]
    pub urls: Vec<String>,
    /// WebSocket host for streaming providers.
    #[serde(default)]
    pub websocket: String,
    /// Poll interval for polling providers.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Liveness deadline for streaming providers: no inbound frame within
    /// this window means the connection is dead.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Symbol -> contract address or pool id.
    #[serde(default)]
    pub contracts: HashMap<String, String>,
    /// Symbol -> token decimal precision.
    #[serde(default)]
    pub decimals: HashMap<String, i64>,
    /// How many recent block heights the volume window covers.
    #[serde(default)]
    pub volume_blocks: u64,
    /// Pause between sequential backfill fetches, to respect upstream rate
    /// limits.
    #[serde(default)]
    pub volume_pause_ms: u64,
}

impl Endpoint {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn volume_pause(&self) -> Duration {
        Duration::from_millis(self.volume_pause_ms)
    }
}

/// Top-level configuration consumed by the host process.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Directory for persisted volume windows.
    pub data_dir: String,
    /// Provider name -> endpoint.
    pub providers: HashMap<String, Endpoint>,
}

impl AppConfig {
    /// Load configuration from a YAML file, with `MARKETFEED_*` environment
    /// overrides applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("MARKETFEED").separator("__"))
            .build()
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults() {
        let endpoint: Endpoint = serde_json::from_value(serde_json::json!({
            "name": "fin",
            "urls": ["https://lcd.example.com"],
        }))
        .unwrap();

        assert_eq!(endpoint.poll_interval(), Duration::from_secs(4));
        assert_eq!(endpoint.ping_timeout(), Duration::from_secs(30));
        assert_eq!(endpoint.volume_blocks, 0);
        assert!(endpoint.contracts.is_empty());
    }
}
