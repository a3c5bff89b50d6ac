//! Wire frames for the venue stream endpoints.
//!
//! Both stream endpoints speak the same op-based protocol: the client
//! sends `{"op": ..., "args": [...]}` frames, the server replies with
//! op acks and pushes `{"topic": ..., "data": ...}` frames for every
//! subscribed topic. The private endpoint additionally requires an
//! `auth` op before the `order` topic can be subscribed.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use ripcord_core::{
    ClientOrderId, ExchangeId, Order, OrderGroupId, OrderRole, OrderSide, OrderStatus, OrderType,
    Price, Qty, UserId,
};
use ripcord_store::ExecutionUpdate;

type HmacSha256 = Hmac<Sha256>;

/// Topic carrying order lifecycle events on the private endpoint.
pub const ORDER_TOPIC: &str = "order";

/// Topic name for one symbol's ticker feed.
pub fn ticker_topic(symbol: &str) -> String {
    format!("tickers.{symbol}")
}

/// Symbol of a ticker topic, `None` for any other topic.
pub fn ticker_symbol(topic: &str) -> Option<&str> {
    topic.strip_prefix("tickers.")
}

// ============================================================================
// Outgoing frames
// ============================================================================

/// Client-to-server op frame.
#[derive(Debug, Clone, Serialize)]
pub struct OpFrame {
    pub op: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl OpFrame {
    /// Login frame for the private endpoint.
    ///
    /// ```json
    /// {"op": "auth", "args": ["<api_key>", 1700000005000, "<hex signature>"]}
    /// ```
    ///
    /// The signature covers the fixed challenge string plus the expiry,
    /// so a captured frame is useless once the expiry passes.
    pub fn auth(api_key: &str, api_secret: &str, expires_ms: u64) -> Self {
        let signature = sign_challenge(api_secret, expires_ms);
        Self {
            op: "auth",
            args: vec![
                serde_json::Value::from(api_key),
                serde_json::Value::from(expires_ms),
                serde_json::Value::from(signature),
            ],
        }
    }

    pub fn subscribe(topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            op: "subscribe",
            args: topics.into_iter().map(serde_json::Value::from).collect(),
        }
    }

    pub fn unsubscribe(topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            op: "unsubscribe",
            args: topics.into_iter().map(serde_json::Value::from).collect(),
        }
    }

    /// Application-level heartbeat, answered with `{"op": "pong"}`.
    pub fn ping() -> Self {
        Self {
            op: "ping",
            args: Vec::new(),
        }
    }
}

/// HMAC-SHA256 over `GET/realtime{expires_ms}`, hex-encoded.
pub fn sign_challenge(api_secret: &str, expires_ms: u64) -> String {
    let material = format!("GET/realtime{expires_ms}");
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(material.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ============================================================================
// Incoming frames
// ============================================================================

/// Server-to-client frame.
///
/// Acks answer an op we sent (including `{"op": "pong"}`); topic frames
/// are pushed data for subscribed topics.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Ack(OpAck),
    Topic(TopicFrame),
}

impl InboundFrame {
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Ack(ack) if ack.is_pong())
    }
}

/// Reply to a client op.
#[derive(Debug, Clone, Deserialize)]
pub struct OpAck {
    pub op: String,
    /// Absent on pong frames.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
}

impl OpAck {
    pub fn is_pong(&self) -> bool {
        self.op == "pong"
    }

    /// Acks without an explicit flag count as accepted.
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(true)
    }
}

/// Pushed data for one subscribed topic.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicFrame {
    pub topic: String,
    /// Server send time, epoch milliseconds.
    #[serde(default)]
    pub ts: Option<u64>,
    pub data: serde_json::Value,
}

impl TopicFrame {
    pub fn is_order(&self) -> bool {
        self.topic == ORDER_TOPIC
    }

    /// Parse the payload of an `order` topic frame.
    ///
    /// The server batches events into an array; a bare object is
    /// tolerated as a one-element batch. Elements that fail to parse
    /// are counted, not fatal, so one malformed event cannot hide the
    /// rest of the batch.
    pub fn order_events(&self) -> OrderEventBatch {
        let mut batch = OrderEventBatch::default();
        let elements: Vec<&serde_json::Value> = match &self.data {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for element in elements {
            match serde_json::from_value::<OrderEvent>(element.clone()) {
                Ok(event) => batch.events.push(event),
                Err(_) => batch.failed += 1,
            }
        }
        batch
    }

    /// Parse the payload of a `tickers.*` topic frame.
    pub fn ticker(&self) -> Option<TickerEvent> {
        ticker_symbol(&self.topic)?;
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Result of parsing one order batch.
#[derive(Debug, Clone, Default)]
pub struct OrderEventBatch {
    pub events: Vec<OrderEvent>,
    /// Elements dropped because they failed to parse.
    pub failed: usize,
}

/// One order lifecycle event from the private stream.
///
/// ```json
/// {
///   "orderId": "88211",
///   "clientOrderId": "rip_1700000000000_ab12cd34",
///   "symbol": "BTCUSDT",
///   "side": "sell",
///   "orderType": "limit",
///   "status": "FILLED",
///   "qty": "0.5",
///   "price": "45000",
///   "executedQty": "0.5",
///   "cumulativeQuote": "22500",
///   "updatedAt": 1700000000000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cumulative_quote: Decimal,
    /// Event time, epoch milliseconds.
    pub updated_at: u64,
}

impl OrderEvent {
    fn updated_at_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.updated_at as i64).unwrap_or_else(Utc::now)
    }

    /// Reduce the event to the store's execution-update form.
    pub fn execution_update(&self, exchange: ExchangeId) -> ExecutionUpdate {
        ExecutionUpdate {
            exchange,
            exchange_order_id: Some(self.order_id.clone()),
            client_order_id: self.client_order_id.clone(),
            status: self.status,
            executed_qty: Qty::new(self.executed_qty),
            cumulative_quote: self.cumulative_quote,
            at: self.updated_at_utc(),
        }
    }

    /// Build a full order record for an order this service never
    /// placed.
    ///
    /// Buy fills learned this way become entries the position ledger
    /// can resolve exits against. Foreign sells are kept for history
    /// only: they get a fresh group id, so they never count against
    /// any entry's remaining quantity.
    pub fn to_order(&self, user_id: UserId, exchange: ExchangeId) -> Order {
        let at = self.updated_at_utc();
        let mut order = Order {
            id: Uuid::new_v4(),
            user_id,
            exchange,
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            role: match self.side {
                OrderSide::Buy => OrderRole::Entry,
                OrderSide::Sell => OrderRole::TimeExit,
            },
            status: self.status,
            qty: Qty::new(self.qty),
            price: self.price.map(Price::new),
            executed_qty: Qty::ZERO,
            cumulative_quote: Decimal::ZERO,
            avg_fill_price: None,
            exchange_order_id: Some(self.order_id.clone()),
            client_order_id: self
                .client_order_id
                .clone()
                .map(ClientOrderId::from_string)
                .unwrap_or_default(),
            group_id: OrderGroupId::new(),
            parent_id: None,
            created_at: at,
            updated_at: at,
            filled_at: None,
        };
        order.apply_execution(
            self.status,
            Qty::new(self.executed_qty),
            self.cumulative_quote,
            at,
        );
        order
    }
}

/// Latest tick for one symbol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerEvent {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
}
