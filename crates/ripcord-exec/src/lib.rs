//! Exit execution: turns resolved exit decisions into venue orders.

pub mod error;
pub mod executor;

pub use error::{ExecError, Result};
pub use executor::{ExitExecutor, ExitFill, ExitRequest};
