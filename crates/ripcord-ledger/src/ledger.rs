//! Position reconstruction from the order store.
//!
//! There is no separate position table. The active position for a
//! (user, exchange, symbol) key is derived on demand: the newest filled
//! entry order, minus whatever the sells in its order group have
//! already executed.

use std::sync::Arc;
use tracing::debug;

use ripcord_core::{ExchangeId, Order, Qty, UserId};
use ripcord_store::OrderStore;

/// An entry order that still has quantity left to exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEntry {
    pub entry: Order,
    /// Entry executed quantity minus executed sell quantity in the
    /// same order group.
    pub remaining: Qty,
}

/// Derives position state from order records.
pub struct PositionLedger {
    store: Arc<dyn OrderStore>,
    /// Remainders at or below this are treated as closed. Exchanges
    /// leave dust after rounding that can never be sold.
    dust_tolerance: Qty,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn OrderStore>, dust_tolerance: Qty) -> Self {
        Self {
            store,
            dust_tolerance,
        }
    }

    pub fn dust_tolerance(&self) -> Qty {
        self.dust_tolerance
    }

    /// The active entry for a key, if one exists.
    ///
    /// Entries are scanned newest fill first and the first one with
    /// quantity left above dust wins. Newest-first matters: several
    /// sequential entries can exist for one symbol, and an exit must
    /// resolve against the most recently opened unclosed round, never
    /// against an older entry whose group already absorbed its sells.
    pub fn active_entry(
        &self,
        user: &UserId,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Option<ActiveEntry> {
        for entry in self.store.filled_entries(user, exchange, symbol) {
            let remaining = self.remaining_for(&entry);
            if remaining.inner() > self.dust_tolerance.inner() {
                return Some(ActiveEntry { entry, remaining });
            }
            debug!(
                user = %user,
                symbol = %symbol,
                entry_id = %entry.id,
                remaining = %remaining,
                "entry fully exited, checking older rounds"
            );
        }
        None
    }

    /// Executed entry quantity minus executed sells in the group,
    /// floored at zero (stream races can briefly over-report sells).
    fn remaining_for(&self, entry: &Order) -> Qty {
        let sold: Qty = self
            .store
            .sells_in_group(&entry.group_id)
            .iter()
            .fold(Qty::ZERO, |acc, o| acc + o.executed_qty);

        let remaining = entry.executed_qty.inner() - sold.inner();
        if remaining.is_sign_negative() {
            Qty::ZERO
        } else {
            Qty::new(remaining)
        }
    }

    /// Whether selling `sold` out of `remaining` closes the position.
    pub fn closes_position(&self, remaining: Qty, sold: Qty) -> bool {
        remaining.inner() - sold.inner() <= self.dust_tolerance.inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ripcord_core::{
        ClientOrderId, OrderGroupId, OrderRole, OrderSide, OrderStatus, OrderType, Price,
    };
    use ripcord_store::MemoryOrderStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn ledger(store: Arc<MemoryOrderStore>) -> PositionLedger {
        PositionLedger::new(store, Qty::new(dec!(0.0001)))
    }

    fn filled_entry(symbol: &str, qty: Decimal, mins_ago: i64) -> Order {
        let filled = Utc::now() - Duration::minutes(mins_ago);
        Order {
            id: Uuid::new_v4(),
            user_id: UserId::from("u1"),
            exchange: ExchangeId::Binance,
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            role: OrderRole::Entry,
            status: OrderStatus::Filled,
            qty: Qty::new(qty),
            price: None,
            executed_qty: Qty::new(qty),
            cumulative_quote: qty * dec!(50000),
            avg_fill_price: Some(Price::new(dec!(50000))),
            exchange_order_id: Some(Uuid::new_v4().to_string()),
            client_order_id: ClientOrderId::new(),
            group_id: OrderGroupId::new(),
            parent_id: None,
            created_at: filled,
            updated_at: filled,
            filled_at: Some(filled),
        }
    }

    fn sell_in_group(entry: &Order, executed: Decimal) -> Order {
        let mut sell = filled_entry(&entry.symbol, executed, 1);
        sell.side = OrderSide::Sell;
        sell.role = OrderRole::Tp1;
        sell.group_id = entry.group_id;
        sell.parent_id = Some(entry.id);
        sell
    }

    #[test]
    fn test_no_entries_means_no_position() {
        let store = Arc::new(MemoryOrderStore::new());
        let ledger = ledger(store);
        assert!(ledger
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .is_none());
    }

    #[test]
    fn test_untouched_entry_is_fully_active() {
        let store = Arc::new(MemoryOrderStore::new());
        let entry = filled_entry("BTCUSDT", dec!(0.5), 60);
        store.insert(entry.clone()).unwrap();

        let active = ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .unwrap();
        assert_eq!(active.entry.id, entry.id);
        assert_eq!(active.remaining, Qty::new(dec!(0.5)));
    }

    #[test]
    fn test_partial_exit_reduces_remaining() {
        let store = Arc::new(MemoryOrderStore::new());
        let entry = filled_entry("BTCUSDT", dec!(1), 60);
        store.insert(sell_in_group(&entry, dec!(0.4))).unwrap();
        store.insert(entry).unwrap();

        let active = ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .unwrap();
        assert_eq!(active.remaining, Qty::new(dec!(0.6)));
    }

    #[test]
    fn test_dust_remainder_is_closed() {
        let store = Arc::new(MemoryOrderStore::new());
        let entry = filled_entry("BTCUSDT", dec!(1), 60);
        store.insert(sell_in_group(&entry, dec!(0.99995))).unwrap();
        store.insert(entry).unwrap();

        assert!(ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .is_none());
    }

    #[test]
    fn test_newest_entry_wins() {
        let store = Arc::new(MemoryOrderStore::new());
        let old = filled_entry("BTCUSDT", dec!(2), 600);
        let recent = filled_entry("BTCUSDT", dec!(0.5), 10);
        store.insert(old).unwrap();
        store.insert(recent.clone()).unwrap();

        let active = ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .unwrap();
        assert_eq!(active.entry.id, recent.id);
        assert_eq!(active.remaining, Qty::new(dec!(0.5)));
    }

    #[test]
    fn test_closed_newest_round_falls_back_to_open_older_round() {
        let store = Arc::new(MemoryOrderStore::new());
        let old = filled_entry("BTCUSDT", dec!(2), 600);
        let recent = filled_entry("BTCUSDT", dec!(0.5), 10);
        store.insert(sell_in_group(&recent, dec!(0.5))).unwrap();
        store.insert(old.clone()).unwrap();
        store.insert(recent).unwrap();

        // The newest round is flat but the older one never closed.
        let active = ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .unwrap();
        assert_eq!(active.entry.id, old.id);
        assert_eq!(active.remaining, Qty::new(dec!(2)));
    }

    #[test]
    fn test_all_rounds_closed_means_no_position() {
        let store = Arc::new(MemoryOrderStore::new());
        let old = filled_entry("BTCUSDT", dec!(2), 600);
        let recent = filled_entry("BTCUSDT", dec!(0.5), 10);
        store.insert(sell_in_group(&old, dec!(2))).unwrap();
        store.insert(sell_in_group(&recent, dec!(0.5))).unwrap();
        store.insert(old).unwrap();
        store.insert(recent).unwrap();

        assert!(ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .is_none());
    }

    #[test]
    fn test_oversold_group_floors_at_zero() {
        let store = Arc::new(MemoryOrderStore::new());
        let entry = filled_entry("BTCUSDT", dec!(1), 60);
        store.insert(sell_in_group(&entry, dec!(1.2))).unwrap();
        store.insert(entry).unwrap();

        assert!(ledger(store)
            .active_entry(&UserId::from("u1"), ExchangeId::Binance, "BTCUSDT")
            .is_none());
    }

    #[test]
    fn test_closes_position_threshold() {
        let store = Arc::new(MemoryOrderStore::new());
        let ledger = ledger(store);
        assert!(ledger.closes_position(Qty::new(dec!(0.5)), Qty::new(dec!(0.5))));
        assert!(ledger.closes_position(Qty::new(dec!(0.5)), Qty::new(dec!(0.49995))));
        assert!(!ledger.closes_position(Qty::new(dec!(0.5)), Qty::new(dec!(0.3))));
    }
}
