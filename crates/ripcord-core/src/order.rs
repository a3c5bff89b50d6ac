//! Order types and the persisted order record.
//!
//! Every order the service places (and every entry it learns about from
//! the private order stream) is kept as an [`Order`] record. Exits are
//! linked to their entry through a shared [`OrderGroupId`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::decimal::{Price, Qty};
use crate::exchange::ExchangeId;
use crate::user::UserId;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Limit order.
    Limit,
    /// Market order (stop-loss and forced exits).
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Time-in-force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancelled (default for resting exit limits).
    #[default]
    #[serde(rename = "Gtc")]
    GoodTilCancelled,
    /// Immediate-or-cancel.
    #[serde(rename = "Ioc")]
    ImmediateOrCancel,
    /// Fill-or-kill.
    #[serde(rename = "Fok")]
    FillOrKill,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoodTilCancelled => write!(f, "Gtc"),
            Self::ImmediateOrCancel => write!(f, "Ioc"),
            Self::FillOrKill => write!(f, "Fok"),
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted by the exchange, no fills yet.
    #[default]
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Returns true if the order can no longer fill.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Returns true if the order is completely filled.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// Role an order plays inside its position group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderRole {
    Entry,
    Tp1,
    Tp2,
    Sl,
    TrailSl,
    TimeExit,
}

impl OrderRole {
    /// Returns true for any exit role.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        !matches!(self, Self::Entry)
    }
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Entry => "ENTRY",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::Sl => "SL",
            Self::TrailSl => "TRAIL_SL",
            Self::TimeExit => "TIME_EXIT",
        };
        write!(f, "{s}")
    }
}

/// Client order ID for idempotency.
///
/// Every submission carries a unique id so a retried request can never
/// double-place on the exchange side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `rip_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("rip_{ts}_{uuid_short}"))
    }

    /// Create from an existing string (for parsing responses).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Links an entry order with every exit placed against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderGroupId(Uuid);

impl OrderGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OrderGroupId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Persisted order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: UserId,
    pub exchange: ExchangeId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub role: OrderRole,
    pub status: OrderStatus,
    /// Requested quantity, already floored to the venue step.
    pub qty: Qty,
    /// Limit price; `None` for market orders.
    pub price: Option<Price>,
    pub executed_qty: Qty,
    /// Cumulative quote volume across fills. Drives the average fill
    /// price once nonzero.
    pub cumulative_quote: Decimal,
    pub avg_fill_price: Option<Price>,
    pub exchange_order_id: Option<String>,
    pub client_order_id: ClientOrderId,
    pub group_id: OrderGroupId,
    /// Entry order this exit was placed against.
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Timestamp anchoring warm-up checks: fill time when known,
    /// otherwise creation time.
    pub fn effective_fill_time(&self) -> DateTime<Utc> {
        self.filled_at.unwrap_or(self.created_at)
    }

    /// Apply a fill/status update from an ack or the order stream.
    ///
    /// Executed quantity and cumulative quote only move forward; a
    /// stale snapshot arriving late cannot regress the record.
    pub fn apply_execution(
        &mut self,
        status: OrderStatus,
        executed_qty: Qty,
        cumulative_quote: Decimal,
        at: DateTime<Utc>,
    ) {
        if executed_qty.inner() > self.executed_qty.inner() {
            self.executed_qty = executed_qty;
        }
        if cumulative_quote > self.cumulative_quote {
            self.cumulative_quote = cumulative_quote;
        }
        if !self.executed_qty.is_zero() && !self.cumulative_quote.is_zero() {
            self.avg_fill_price = Some(Price::new(
                self.cumulative_quote / self.executed_qty.inner(),
            ));
        }
        self.status = status;
        if status.is_filled() && self.filled_at.is_none() {
            self.filled_at = Some(at);
        }
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            user_id: UserId::from("u1"),
            exchange: ExchangeId::Binance,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            role: OrderRole::Entry,
            status: OrderStatus::New,
            qty: Qty::new(dec!(0.5)),
            price: Some(Price::new(dec!(50000))),
            executed_qty: Qty::ZERO,
            cumulative_quote: Decimal::ZERO,
            avg_fill_price: None,
            exchange_order_id: Some("123".to_string()),
            client_order_id: ClientOrderId::new(),
            group_id: OrderGroupId::new(),
            parent_id: None,
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_client_order_id_format() {
        let id = ClientOrderId::new();
        assert!(id.as_str().starts_with("rip_"));
    }

    #[test]
    fn test_client_order_id_unique() {
        assert_ne!(ClientOrderId::new(), ClientOrderId::new());
    }

    #[test]
    fn test_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        let s: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::PartiallyFilled);
        assert_eq!(
            serde_json::to_string(&OrderRole::TrailSl).unwrap(),
            "\"TRAIL_SL\""
        );
    }

    #[test]
    fn test_apply_execution_sets_avg_price() {
        let mut order = sample_order();
        let at = Utc::now();
        order.apply_execution(OrderStatus::Filled, Qty::new(dec!(0.5)), dec!(25000), at);

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(Price::new(dec!(50000))));
        assert_eq!(order.filled_at, Some(at));
    }

    #[test]
    fn test_apply_execution_never_regresses_fills() {
        let mut order = sample_order();
        let at = Utc::now();
        order.apply_execution(
            OrderStatus::PartiallyFilled,
            Qty::new(dec!(0.3)),
            dec!(15000),
            at,
        );
        // Stale snapshot with lower executed qty arrives late.
        order.apply_execution(OrderStatus::Filled, Qty::new(dec!(0.1)), dec!(5000), at);

        assert_eq!(order.executed_qty, Qty::new(dec!(0.3)));
        assert_eq!(order.cumulative_quote, dec!(15000));
    }

    #[test]
    fn test_effective_fill_time_falls_back_to_created() {
        let order = sample_order();
        assert_eq!(order.effective_fill_time(), order.created_at);
    }
}
