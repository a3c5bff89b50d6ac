//! Cached symbol precision rules.
//!
//! Tick sizes and lot steps change rarely, while every exit needs
//! them. A short TTL keeps the instruments endpoint out of the hot
//! path without risking stale filters for long.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use ripcord_core::{ExchangeId, SymbolRules};

use crate::client::ExchangeClient;
use crate::error::Result;

const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct CachedRules {
    rules: SymbolRules,
    fetched_at: Instant,
}

/// Process-wide precision rule cache keyed by venue and symbol.
pub struct RulesCache {
    entries: DashMap<(ExchangeId, String), CachedRules>,
    ttl: Duration,
}

impl Default for RulesCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl RulesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Rules for a symbol, fetched through `client` on miss or expiry.
    pub async fn get_or_fetch(
        &self,
        client: &dyn ExchangeClient,
        symbol: &str,
    ) -> Result<SymbolRules> {
        let key = (client.exchange_id(), symbol.to_string());

        if let Some(entry) = self.entries.get(&key) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.rules);
            }
        }

        let rules = client.symbol_rules(symbol).await?;
        debug!(exchange = %key.0, symbol, "symbol rules refreshed");
        self.entries.insert(
            key,
            CachedRules {
                rules,
                fetched_at: Instant::now(),
            },
        );
        Ok(rules)
    }

    /// Seed an entry directly. Test and preflight use.
    pub fn insert(&self, exchange: ExchangeId, symbol: &str, rules: SymbolRules) {
        self.entries.insert(
            (exchange, symbol.to_string()),
            CachedRules {
                rules,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
