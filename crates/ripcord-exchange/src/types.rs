//! Request/response types shared by all venue clients.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ripcord_core::{ClientOrderId, OrderSide, OrderStatus, OrderType, Price, Qty, TimeInForce};

/// A new order ready for submission. Quantities and prices are
/// expected to be aligned to the venue grid before this is built.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Qty,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<Price>,
    pub tif: TimeInForce,
    pub client_order_id: ClientOrderId,
}

/// Submission acknowledgement.
///
/// Venues differ in how much fill information the ack carries:
/// Binance RESULT responses include immediate fills, Bybit acks carry
/// ids only. Zero executed quantity here is not a statement that
/// nothing filled, just that the ack did not say.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub executed_qty: Qty,
    pub cumulative_quote: Decimal,
}

impl OrderAck {
    /// Average price of the fills reported in the ack, if any.
    pub fn immediate_fill_price(&self) -> Option<Price> {
        if self.executed_qty.is_positive() && !self.cumulative_quote.is_zero() {
            Some(Price::new(self.cumulative_quote / self.executed_qty.inner()))
        } else {
            None
        }
    }
}

/// One asset row of an account balance snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Qty,
    pub locked: Qty,
}

/// Account balance snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceSheet {
    balances: Vec<AssetBalance>,
}

impl BalanceSheet {
    pub fn new(balances: Vec<AssetBalance>) -> Self {
        Self { balances }
    }

    /// Free amount for an asset; absent assets are zero.
    pub fn free(&self, asset: &str) -> Qty {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Qty::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetBalance> {
        self.balances.iter()
    }
}
