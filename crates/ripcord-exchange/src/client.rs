//! Exchange capability trait and the per-user client registry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use ripcord_core::{ExchangeId, SymbolRules, UserId};
use ripcord_store::ApiCredentials;

use crate::binance::BinanceClient;
use crate::bybit::BybitClient;
use crate::error::{ExchangeError, Result};
use crate::types::{BalanceSheet, NewOrder, OrderAck};

/// What the execution pipeline needs from a venue.
///
/// One instance is bound to one user's credentials; routing across
/// users happens in [`ExchangeRegistry`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange_id(&self) -> ExchangeId;

    /// Current account balances.
    async fn balances(&self) -> Result<BalanceSheet>;

    /// Submit a new order.
    async fn place_order(&self, order: &NewOrder) -> Result<OrderAck>;

    /// Cancel every resting order on a symbol. Returns how many the
    /// venue reported cancelled.
    async fn cancel_all(&self, symbol: &str) -> Result<u32>;

    /// Tick/step/notional constraints for a symbol.
    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules>;
}

/// REST endpoints for one venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEndpoints {
    pub rest_url: String,
    /// Signed-request tolerance for clock drift, in milliseconds.
    pub recv_window_ms: u64,
}

/// Builds and caches one REST client per user.
///
/// Clients hold a connection pool, so rebuilding them per trigger
/// would defeat keep-alive. The cache key is the user id; credentials
/// are fixed for the process lifetime.
pub struct ExchangeRegistry {
    binance: Option<ExchangeEndpoints>,
    bybit: Option<ExchangeEndpoints>,
    clients: DashMap<UserId, Arc<dyn ExchangeClient>>,
}

impl ExchangeRegistry {
    pub fn new(binance: Option<ExchangeEndpoints>, bybit: Option<ExchangeEndpoints>) -> Self {
        Self {
            binance,
            bybit,
            clients: DashMap::new(),
        }
    }

    /// Client for one user's venue, built on first use.
    pub fn client_for(&self, creds: &ApiCredentials) -> Result<Arc<dyn ExchangeClient>> {
        if let Some(client) = self.clients.get(&creds.user_id) {
            return Ok(client.clone());
        }

        let client = self.build_client(creds)?;
        debug!(user = %creds.user_id, exchange = %creds.exchange, "exchange client created");
        self.clients.insert(creds.user_id.clone(), client.clone());
        Ok(client)
    }

    /// Seed a prebuilt client for a user. Test use.
    pub fn insert(&self, user: UserId, client: Arc<dyn ExchangeClient>) {
        self.clients.insert(user, client);
    }

    fn build_client(&self, creds: &ApiCredentials) -> Result<Arc<dyn ExchangeClient>> {
        match creds.exchange {
            ExchangeId::Binance => {
                let endpoints = self
                    .binance
                    .as_ref()
                    .ok_or_else(|| ExchangeError::NotConfigured("binance".into()))?;
                Ok(Arc::new(BinanceClient::new(
                    endpoints,
                    &creds.api_key,
                    &creds.api_secret,
                )?))
            }
            ExchangeId::Bybit => {
                let endpoints = self
                    .bybit
                    .as_ref()
                    .ok_or_else(|| ExchangeError::NotConfigured("bybit".into()))?;
                Ok(Arc::new(BybitClient::new(
                    endpoints,
                    &creds.api_key,
                    &creds.api_secret,
                )?))
            }
        }
    }
}
