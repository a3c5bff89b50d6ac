//! Supported exchange identifiers and symbol conventions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Venue an order is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            other => Err(CoreError::UnknownExchange(other.to_string())),
        }
    }
}

/// Quote assets recognized when splitting concatenated spot symbols,
/// longest first so USDT wins over USD-prefixed lookalikes.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "FDUSD", "TUSD", "BUSD", "USD", "BTC", "ETH"];

/// Split a concatenated spot symbol into base and quote assets.
///
/// Both supported venues name spot markets `{BASE}{QUOTE}` with a
/// well-known quote set, e.g. `BTCUSDT` -> (`BTC`, `USDT`).
pub fn split_symbol(symbol: &str) -> Result<(&str, &str), CoreError> {
    for quote in KNOWN_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok((base, quote));
            }
        }
    }
    Err(CoreError::InvalidSymbol(symbol.to_string()))
}
