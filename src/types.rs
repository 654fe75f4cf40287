//! Core types used throughout MarketFeed
//!
//! Defines currency pairs, tickers and the decimal helpers shared by all
//! providers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FeedError;

/// A tradeable base/quote asset combination.
///
/// Equality is by symbol pair; the canonical string form is `BASEQUOTE`
/// regardless of how a provider spells the pair locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Canonical symbol, e.g. `ATOMUSDC`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// The same pair with base and quote swapped.
    pub fn swap(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Last observed price/volume for one symbol.
///
/// Overwritten in place on every new observation; staleness detection is the
/// downstream aggregator's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticker {
    pub price: Decimal,
    pub volume: Decimal,
    /// Unix milliseconds of the observation.
    pub time: i64,
}

/// A token amount resolved to its canonical symbol.
#[derive(Debug, Clone)]
pub struct Denom {
    pub symbol: String,
    pub amount: Decimal,
}

/// Parse a decimal string from an upstream payload.
pub fn parse_dec(s: &str) -> Result<Decimal, FeedError> {
    Decimal::from_str(s).map_err(|e| FeedError::Parse(format!("invalid decimal {s:?}: {e}")))
}

/// 10^exp as a decimal.
pub fn pow10(exp: u32) -> Decimal {
    let mut value = Decimal::ONE;
    for _ in 0..exp {
        value *= Decimal::TEN;
    }
    value
}

/// Scale an integer on-chain amount by `10^-decimals`.
///
/// A negative decimal count (possible when derived via a decimal delta)
/// scales up instead.
pub fn scale_down(amount: Decimal, decimals: i64) -> Decimal {
    if decimals >= 0 {
        amount / pow10(decimals as u32)
    } else {
        amount * pow10(decimals.unsigned_abs() as u32)
    }
}

/// Split a concatenated amount/denom string, e.g. `"1200000uosmo"`.
pub fn parse_denom(token: &str) -> Result<(Decimal, String), FeedError> {
    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| FeedError::Parse(format!("no denom in token {token:?}")))?;
    if split == 0 {
        return Err(FeedError::Parse(format!("no amount in token {token:?}")));
    }
    let amount = parse_dec(&token[..split])?;
    Ok((amount, token[split..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pair_symbol_and_swap() {
        let pair = CurrencyPair::new("atom", "usdc");
        assert_eq!(pair.symbol(), "ATOMUSDC");
        assert_eq!(pair.swap().symbol(), "USDCATOM");
        assert_eq!(pair.swap().swap(), pair);
    }

    #[test]
    fn scale_down_positive_and_negative() {
        assert_eq!(scale_down(dec!(1500000), 6), dec!(1.5));
        assert_eq!(scale_down(dec!(1.5), -3), dec!(1500));
        assert_eq!(scale_down(dec!(42), 0), dec!(42));
    }

    #[test]
    fn parse_denom_splits_amount_and_denom() {
        let (amount, denom) = parse_denom("1200000uosmo").unwrap();
        assert_eq!(amount, dec!(1200000));
        assert_eq!(denom, "uosmo");

        let (amount, denom) = parse_denom("5ibc/27394FB092D2ECCD").unwrap();
        assert_eq!(amount, dec!(5));
        assert_eq!(denom, "ibc/27394FB092D2ECCD");

        assert!(parse_denom("uosmo").is_err());
        assert!(parse_denom("123").is_err());
    }

    #[test]
    fn parse_dec_rejects_garbage() {
        assert_eq!(parse_dec("104.5").unwrap(), dec!(104.5));
        assert!(parse_dec("NaN").is_err());
        assert!(parse_dec("").is_err());
    }
}
