//! MarketFeed Library
//!
//! Ingestion and volume-reconstruction engine for price oracles: streaming
//! exchange sockets and polled chain endpoints normalized into one
//! last-known-ticker contract per currency pair.

pub mod chain;
pub mod config;
pub mod error;
pub mod provider;
pub mod telemetry;
pub mod types;
pub mod volume;
