//! Error taxonomy for ingestion and the query contract
//!
//! Per-pair failures inside a poll cycle are logged and contained; only the
//! query-time variants (`NotSubscribed`, `NoData`) surface to callers of
//! `get_ticker_prices`.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Socket, HTTP or RPC failure. Triggers reconnect for streaming
    /// providers, skip-and-retry-next-cycle for polling providers.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed upstream payload. The sample is dropped, never fatal.
    #[error("failed to parse upstream payload: {0}")]
    Parse(String),

    /// No channel or mapping exists yet for the requested symbol.
    #[error("not subscribed to {symbol}")]
    NotSubscribed { symbol: String },

    /// Subscribed, but no tick has ever landed for the symbol.
    #[error("no ticker data for {symbol}")]
    NoData { symbol: String },

    /// Two-sided quote diverged past the spread ceiling; sample rejected.
    #[error("spread too wide for {symbol}: {spread}")]
    SpreadTooWide { symbol: String, spread: Decimal },

    /// Upstream produced an unusable price (NaN, unparsable, empty book).
    #[error("invalid price for {symbol}: {reason}")]
    InvalidPrice { symbol: String, reason: String },

    /// Unsupported pool type, missing decimals, missing contract mapping.
    /// The pair is skipped until configuration changes.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse(err.to_string())
    }
}
