//! Order-derived position ledger.

pub mod ledger;

pub use ledger::{ActiveEntry, PositionLedger};
