//! In-memory order store.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use ripcord_core::{ExchangeId, Order, OrderGroupId, OrderRole, OrderSide, UserId};

use crate::error::{Result, StoreError};
use crate::orders::{ExecutionUpdate, OrderStore};

/// Order store backed by a process-local map.
///
/// Scans are linear; the working set is the orders of one bot
/// deployment, which stays small enough that indexes would be noise.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderStore for MemoryOrderStore {
    fn insert(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write();
        if orders.contains_key(&order.id) {
            return Err(StoreError::DuplicateOrder(order.id));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Option<Order> {
        self.orders.read().get(&id).cloned()
    }

    fn filled_entries(&self, user: &UserId, exchange: ExchangeId, symbol: &str) -> Vec<Order> {
        let orders = self.orders.read();
        let mut entries: Vec<Order> = orders
            .values()
            .filter(|o| {
                o.user_id == *user
                    && o.exchange == exchange
                    && o.symbol == symbol
                    && o.side == OrderSide::Buy
                    && o.role == OrderRole::Entry
                    && o.status.is_filled()
            })
            .cloned()
            .collect();
        entries.sort_by_key(|o| std::cmp::Reverse(o.effective_fill_time()));
        entries
    }

    fn sells_in_group(&self, group: &OrderGroupId) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.group_id == *group && o.side == OrderSide::Sell)
            .cloned()
            .collect()
    }

    fn apply_execution(&self, update: &ExecutionUpdate) -> Result<bool> {
        let mut orders = self.orders.write();
        let target = orders.values_mut().find(|o| {
            o.exchange == update.exchange
                && (matches(o.exchange_order_id.as_deref(), &update.exchange_order_id)
                    || matches(Some(o.client_order_id.as_str()), &update.client_order_id))
        });

        match target {
            Some(order) => {
                order.apply_execution(
                    update.status,
                    update.executed_qty,
                    update.cumulative_quote,
                    update.at,
                );
                Ok(true)
            }
            None => {
                debug!(
                    exchange = %update.exchange,
                    order_id = ?update.exchange_order_id,
                    "execution update for untracked order, ignoring"
                );
                Ok(false)
            }
        }
    }

    fn len(&self) -> usize {
        self.orders.read().len()
    }
}

fn matches(stored: Option<&str>, incoming: &Option<String>) -> bool {
    match (stored, incoming) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
