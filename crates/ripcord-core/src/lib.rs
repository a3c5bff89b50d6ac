//! Core domain types for the ripcord exit-execution service.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Price`, `Qty`: precision-safe numeric types with exchange alignment
//! - `SymbolRules`: per-symbol tick/step/notional constraints
//! - `Order` and its enums: the persisted order record
//! - `TriggerKind`: exit signals received from the webhook
//! - `ExchangeId`, `UserId`: routing identities

pub mod decimal;
pub mod error;
pub mod exchange;
pub mod order;
pub mod trigger;
pub mod user;

pub use decimal::{Price, Qty, SymbolRules};
pub use error::{CoreError, Result};
pub use exchange::{split_symbol, ExchangeId};
pub use order::{
    ClientOrderId, Order, OrderGroupId, OrderRole, OrderSide, OrderStatus, OrderType, TimeInForce,
};
pub use trigger::{position_slot, TriggerKind};
pub use user::UserId;
