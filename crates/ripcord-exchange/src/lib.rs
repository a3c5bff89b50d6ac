//! Exchange REST clients for the ripcord exit-execution service.
//!
//! One trait, [`ExchangeClient`], covers what execution needs from a
//! venue: balances, order submission, cancel-all, and precision rules.
//! Binance and Bybit implementations sign with HMAC-SHA256 in their
//! respective styles. [`with_retry`] provides the bounded, transport-
//! only retry used around submissions and balance fetches.

pub mod binance;
pub mod bybit;
pub mod client;
pub mod error;
pub mod retry;
pub mod rules_cache;
pub mod types;

pub use binance::BinanceClient;
pub use bybit::BybitClient;
pub use client::{ExchangeClient, ExchangeEndpoints, ExchangeRegistry};
pub use error::{ExchangeError, Result};
pub use retry::{with_retry, RetryPolicy};
pub use rules_cache::RulesCache;
pub use types::{AssetBalance, BalanceSheet, NewOrder, OrderAck};
