//! Order store trait and the execution-update record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use ripcord_core::{ExchangeId, Order, OrderGroupId, OrderStatus, Qty, UserId};

use crate::error::Result;

/// Execution progress for a tracked order, decoupled from any one
/// wire format. Both REST acks and the private order stream reduce
/// to this before touching the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub exchange: ExchangeId,
    /// At least one of the two ids must be present to match a record.
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub executed_qty: Qty,
    pub cumulative_quote: Decimal,
    pub at: DateTime<Utc>,
}

/// Persistence seam for order records.
///
/// The deployment runs memory-backed (orders are reconstructible from
/// the exchange), but the seam keeps executor and ledger code honest
/// about what they read and write.
pub trait OrderStore: Send + Sync {
    /// Persist a new order record.
    fn insert(&self, order: Order) -> Result<()>;

    /// Fetch a record by internal id.
    fn get(&self, id: Uuid) -> Option<Order>;

    /// Filled entry (buy) orders for a user/exchange/symbol, newest
    /// fill first.
    fn filled_entries(&self, user: &UserId, exchange: ExchangeId, symbol: &str) -> Vec<Order>;

    /// Every sell order belonging to an order group.
    fn sells_in_group(&self, group: &OrderGroupId) -> Vec<Order>;

    /// Apply an execution update to the matching record, if any.
    ///
    /// Returns `true` when a record matched. Updates for orders the
    /// service never placed (manual trades on the same account) are
    /// not an error; callers log and move on.
    fn apply_execution(&self, update: &ExecutionUpdate) -> Result<bool>;

    /// Number of records held. Health reporting only.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
