//! Exit order construction and submission.
//!
//! One call of [`ExitExecutor::execute`] turns a per-user exit
//! decision into an exchange order: cancel resting orders, align to
//! the venue grid, pick limit versus market, submit with bounded
//! retries behind the circuit breaker, and persist the result.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ripcord_core::{
    ClientOrderId, ExchangeId, Order, OrderGroupId, OrderSide, OrderType, Price, Qty, SymbolRules,
    TimeInForce, TriggerKind, UserId,
};
use ripcord_exchange::{with_retry, ExchangeClient, NewOrder, RetryPolicy, RulesCache};
use ripcord_risk::CircuitBreaker;
use ripcord_store::OrderStore;

use crate::error::{ExecError, Result};

/// One user's exit, resolved by the trigger pipeline down to a
/// concrete quantity, awaiting venue alignment.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub user_id: UserId,
    pub symbol: String,
    pub trigger: TriggerKind,
    /// Target quantity before flooring to the venue step.
    pub qty: Qty,
    /// Price carried by the trigger; zero when the source had none.
    pub reference_price: Price,
    /// Entry order being exited.
    pub entry_id: Uuid,
    pub group_id: OrderGroupId,
}

/// Outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ExitFill {
    /// The persisted exit order record.
    pub order: Order,
    /// Best known price for reporting: immediate-fill average for
    /// market orders (zero until the stream corrects it), the limit
    /// price for resting limits.
    pub fill_price: Price,
}

/// Submits exit orders for the trigger pipeline.
pub struct ExitExecutor {
    store: Arc<dyn OrderStore>,
    breaker: Arc<CircuitBreaker>,
    rules: Arc<RulesCache>,
    retry: RetryPolicy,
}

impl ExitExecutor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        breaker: Arc<CircuitBreaker>,
        rules: Arc<RulesCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            breaker,
            rules,
            retry,
        }
    }

    /// Execute one exit on the venue behind `client`.
    pub async fn execute(
        &self,
        client: &Arc<dyn ExchangeClient>,
        request: ExitRequest,
    ) -> Result<ExitFill> {
        let exchange = client.exchange_id();
        self.breaker.check(&request.user_id, exchange)?;

        // Resting TP/SL orders would collide with the exit or eat the
        // balance we are about to sell. Best effort: a failed cancel
        // must not block the exit itself.
        match client.cancel_all(&request.symbol).await {
            Ok(n) if n > 0 => {
                debug!(user = %request.user_id, symbol = %request.symbol, cancelled = n, "cleared resting orders")
            }
            Ok(_) => {}
            Err(e) => {
                warn!(user = %request.user_id, symbol = %request.symbol, error = %e, "cancel-all failed, continuing")
            }
        }

        let rules = match self.rules.get_or_fetch(client.as_ref(), &request.symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                if e.is_retryable() {
                    self.breaker.record_failure(&request.user_id, exchange);
                } else {
                    self.breaker.release_trial(&request.user_id, exchange);
                }
                return Err(e.into());
            }
        };

        let new_order = match self.build_order(&request, exchange, &rules) {
            Ok(order) => order,
            Err(e) => {
                self.breaker.release_trial(&request.user_id, exchange);
                return Err(e);
            }
        };

        let ack = match with_retry(self.retry, "place_order", || client.place_order(&new_order)).await
        {
            Ok(ack) => {
                self.breaker.record_success(&request.user_id, exchange);
                ack
            }
            Err(e) => {
                if e.is_retryable() {
                    self.breaker.record_failure(&request.user_id, exchange);
                } else {
                    self.breaker.release_trial(&request.user_id, exchange);
                }
                return Err(e.into());
            }
        };

        let fill_price = match new_order.order_type {
            OrderType::Market => ack.immediate_fill_price().unwrap_or(Price::ZERO),
            OrderType::Limit => new_order.price.unwrap_or(Price::ZERO),
        };

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            exchange,
            symbol: request.symbol.clone(),
            side: OrderSide::Sell,
            order_type: new_order.order_type,
            role: request.trigger.exit_role(),
            status: ack.status,
            qty: new_order.qty,
            price: new_order.price,
            executed_qty: ack.executed_qty,
            cumulative_quote: ack.cumulative_quote,
            avg_fill_price: ack.immediate_fill_price(),
            exchange_order_id: Some(ack.exchange_order_id.clone()),
            client_order_id: new_order.client_order_id.clone(),
            group_id: request.group_id,
            parent_id: Some(request.entry_id),
            created_at: now,
            updated_at: now,
            filled_at: ack.status.is_filled().then_some(now),
        };
        self.store.insert(order.clone())?;

        info!(
            user = %request.user_id,
            symbol = %request.symbol,
            trigger = %request.trigger,
            order_type = %order.order_type,
            qty = %order.qty,
            exchange_order_id = %ack.exchange_order_id,
            "exit order placed"
        );

        Ok(ExitFill { order, fill_price })
    }

    /// Align the request to the venue grid and pick the order type.
    fn build_order(
        &self,
        request: &ExitRequest,
        exchange: ExchangeId,
        rules: &SymbolRules,
    ) -> Result<NewOrder> {
        let qty = rules.floor_qty(request.qty);
        if qty.is_zero() {
            return Err(ExecError::BelowMinimum(format!(
                "{} floors to zero at step {}",
                request.qty, rules.qty_step
            )));
        }

        // Take-profits with a usable price rest as limits and sell
        // into strength; everything else needs out now.
        let use_limit = request.trigger.is_take_profit() && request.reference_price.is_positive();

        let (order_type, price) = if use_limit {
            (
                OrderType::Limit,
                Some(rules.floor_price(request.reference_price)),
            )
        } else {
            (OrderType::Market, None)
        };

        let check_price = match order_type {
            OrderType::Limit => price.unwrap_or(Price::ZERO),
            OrderType::Market => request.reference_price,
        };
        if !rules.meets_min_notional(qty, check_price) {
            return Err(ExecError::BelowMinimum(format!(
                "notional {} under venue minimum {}",
                qty.notional(check_price),
                rules.min_notional
            )));
        }

        debug!(
            user = %request.user_id,
            exchange = %exchange,
            symbol = %request.symbol,
            order_type = %order_type,
            qty = %qty,
            "exit order built"
        );

        Ok(NewOrder {
            symbol: request.symbol.clone(),
            side: OrderSide::Sell,
            order_type,
            qty,
            price,
            tif: TimeInForce::GoodTilCancelled,
            client_order_id: ClientOrderId::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::always;
    use ripcord_core::{OrderRole, OrderStatus};
    use ripcord_exchange::{BalanceSheet, ExchangeError, OrderAck};
    use ripcord_risk::{BreakerConfig, BreakerState};
    use ripcord_store::MemoryOrderStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    mock! {
        Exchange {}

        #[async_trait]
        impl ExchangeClient for Exchange {
            fn exchange_id(&self) -> ExchangeId;
            async fn balances(&self) -> ripcord_exchange::Result<BalanceSheet>;
            async fn place_order(&self, order: &NewOrder) -> ripcord_exchange::Result<OrderAck>;
            async fn cancel_all(&self, symbol: &str) -> ripcord_exchange::Result<u32>;
            async fn symbol_rules(&self, symbol: &str) -> ripcord_exchange::Result<SymbolRules>;
        }
    }

    fn rules() -> SymbolRules {
        SymbolRules {
            qty_step: Qty::new(dec!(0.001)),
            price_tick: Price::new(dec!(0.01)),
            min_notional: dec!(10),
        }
    }

    fn harness() -> (Arc<MemoryOrderStore>, Arc<CircuitBreaker>, ExitExecutor) {
        let store = Arc::new(MemoryOrderStore::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }));
        let rules_cache = Arc::new(RulesCache::default());
        rules_cache.insert(ExchangeId::Binance, "BTCUSDT", rules());

        let executor = ExitExecutor::new(
            store.clone(),
            breaker.clone(),
            rules_cache,
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        (store, breaker, executor)
    }

    fn request(trigger: TriggerKind, qty: Decimal, reference: Decimal) -> ExitRequest {
        ExitRequest {
            user_id: UserId::from("u1"),
            symbol: "BTCUSDT".into(),
            trigger,
            qty: Qty::new(qty),
            reference_price: Price::new(reference),
            entry_id: Uuid::new_v4(),
            group_id: OrderGroupId::new(),
        }
    }

    fn filled_ack(executed: Decimal, quote: Decimal) -> OrderAck {
        OrderAck {
            exchange_order_id: "42".into(),
            client_order_id: None,
            status: OrderStatus::Filled,
            executed_qty: Qty::new(executed),
            cumulative_quote: quote,
        }
    }

    fn quiet_exchange() -> MockExchange {
        let mut exchange = MockExchange::new();
        exchange.expect_exchange_id().return_const(ExchangeId::Binance);
        exchange.expect_cancel_all().returning(|_| Ok(0));
        exchange
    }

    #[tokio::test]
    async fn test_take_profit_with_price_places_limit() {
        let (store, _, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .withf(|o: &NewOrder| {
                o.order_type == OrderType::Limit
                    && o.side == OrderSide::Sell
                    && o.price == Some(Price::new(dec!(50250.10)))
                    && o.qty == Qty::new(dec!(0.25))
                    && o.tif == TimeInForce::GoodTilCancelled
            })
            .times(1)
            .returning(|_| {
                Ok(OrderAck {
                    exchange_order_id: "42".into(),
                    client_order_id: None,
                    status: OrderStatus::New,
                    executed_qty: Qty::ZERO,
                    cumulative_quote: Decimal::ZERO,
                })
            });
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let fill = executor
            .execute(&client, request(TriggerKind::Tp1Hit, dec!(0.2503), dec!(50250.105)))
            .await
            .unwrap();

        assert_eq!(fill.order.order_type, OrderType::Limit);
        assert_eq!(fill.fill_price, Price::new(dec!(50250.10)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_places_market_even_with_price() {
        let (_, _, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .withf(|o: &NewOrder| o.order_type == OrderType::Market && o.price.is_none())
            .times(1)
            .returning(|_| Ok(filled_ack(dec!(0.25), dec!(12000))));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let fill = executor
            .execute(&client, request(TriggerKind::SlHit, dec!(0.25), dec!(48000)))
            .await
            .unwrap();

        assert_eq!(fill.order.order_type, OrderType::Market);
        assert_eq!(fill.fill_price, Price::new(dec!(48000)));
        assert_eq!(fill.order.avg_fill_price, Some(Price::new(dec!(48000))));
    }

    #[tokio::test]
    async fn test_take_profit_without_price_falls_back_to_market() {
        let (_, _, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .withf(|o: &NewOrder| o.order_type == OrderType::Market)
            .times(1)
            .returning(|_| Ok(filled_ack(dec!(0.25), dec!(12000))));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        executor
            .execute(&client, request(TriggerKind::Tp2Hit, dec!(0.25), dec!(0)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_market_without_immediate_fill_reports_zero_price() {
        let (store, _, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange.expect_place_order().times(1).returning(|_| {
            Ok(OrderAck {
                exchange_order_id: "9".into(),
                client_order_id: None,
                status: OrderStatus::New,
                executed_qty: Qty::ZERO,
                cumulative_quote: Decimal::ZERO,
            })
        });
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let fill = executor
            .execute(&client, request(TriggerKind::TimeExit, dec!(0.25), dec!(0)))
            .await
            .unwrap();

        // The stream corrects this once the fill lands.
        assert_eq!(fill.fill_price, Price::ZERO);
        let stored = store.get(fill.order.id).unwrap();
        assert_eq!(stored.avg_fill_price, None);
    }

    #[tokio::test]
    async fn test_quantity_floored_to_zero_is_below_minimum_skip() {
        let (store, breaker, executor) = harness();
        let exchange = quiet_exchange();
        // No place_order expectation: any call would panic.
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let err = executor
            .execute(&client, request(TriggerKind::Tp1Hit, dec!(0.0004), dec!(50000)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::BelowMinimum(_)));
        assert_eq!(store.len(), 0);
        assert_eq!(
            breaker.state(&UserId::from("u1"), ExchangeId::Binance),
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_sub_notional_exit_is_below_minimum_skip() {
        let (_, _, executor) = harness();
        let client: Arc<dyn ExchangeClient> = Arc::new(quiet_exchange());

        // 0.001 * 100 = 0.1 quote units, under the 10 minimum.
        let err = executor
            .execute(&client, request(TriggerKind::Tp1Hit, dec!(0.001), dec!(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::BelowMinimum(_)));
    }

    #[tokio::test]
    async fn test_cancel_failure_does_not_block_exit() {
        let (_, _, executor) = harness();
        let mut exchange = MockExchange::new();
        exchange.expect_exchange_id().return_const(ExchangeId::Binance);
        exchange
            .expect_cancel_all()
            .times(1)
            .returning(|_| Err(ExchangeError::Timeout("slow".into())));
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Ok(filled_ack(dec!(0.25), dec!(12000))));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        executor
            .execute(&client, request(TriggerKind::SlHit, dec!(0.25), dec!(48000)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transport_errors_retry_three_times_then_trip_breaker() {
        let (store, breaker, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .times(3)
            .returning(|_| Err(ExchangeError::Timeout("venue slow".into())));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let err = executor
            .execute(&client, request(TriggerKind::SlHit, dec!(0.25), dec!(48000)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Exchange(ExchangeError::Timeout(_))));
        assert_eq!(store.len(), 0);
        // failure_threshold = 1 in the harness, so one exhausted
        // operation opens the circuit.
        assert_eq!(
            breaker.state(&UserId::from("u1"), ExchangeId::Binance),
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_fast_without_breaker_trip() {
        let (_, breaker, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Err(ExchangeError::InsufficientBalance("BTC".into())));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let err = executor
            .execute(&client, request(TriggerKind::SlHit, dec!(0.25), dec!(48000)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecError::Exchange(ExchangeError::InsufficientBalance(_))
        ));
        assert_eq!(
            breaker.state(&UserId::from("u1"), ExchangeId::Binance),
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_before_any_venue_call() {
        let (_, breaker, executor) = harness();
        breaker.record_failure(&UserId::from("u1"), ExchangeId::Binance);

        // No venue-call expectations: cancel or submit traffic panics
        // the test.
        let mut exchange = MockExchange::new();
        exchange.expect_exchange_id().return_const(ExchangeId::Binance);
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let err = executor
            .execute(&client, request(TriggerKind::SlHit, dec!(0.25), dec!(48000)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_exit_order_links_entry_group_and_role() {
        let (store, _, executor) = harness();
        let mut exchange = quiet_exchange();
        exchange
            .expect_place_order()
            .with(always())
            .returning(|_| Ok(filled_ack(dec!(0.5), dec!(24000))));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let req = request(TriggerKind::TrailHit, dec!(0.5), dec!(48000));
        let entry_id = req.entry_id;
        let group_id = req.group_id;

        let fill = executor.execute(&client, req).await.unwrap();

        let stored = store.get(fill.order.id).unwrap();
        assert_eq!(stored.parent_id, Some(entry_id));
        assert_eq!(stored.group_id, group_id);
        assert_eq!(stored.role, OrderRole::TrailSl);
        assert!(stored.client_order_id.as_str().starts_with("rip_"));
    }

    #[tokio::test]
    async fn test_rules_fetched_through_cache_when_missing() {
        let (_, _, executor) = harness();
        let mut exchange = MockExchange::new();
        exchange.expect_exchange_id().return_const(ExchangeId::Binance);
        exchange.expect_cancel_all().returning(|_| Ok(0));
        exchange
            .expect_symbol_rules()
            .times(1)
            .returning(|_| Ok(rules()));
        exchange
            .expect_place_order()
            .returning(|_| Ok(filled_ack(dec!(1), dec!(3000))));
        let client: Arc<dyn ExchangeClient> = Arc::new(exchange);

        let mut req = request(TriggerKind::SlHit, dec!(1), dec!(3000));
        req.symbol = "ETHUSDT".into();
        executor.execute(&client, req).await.unwrap();
    }
}
