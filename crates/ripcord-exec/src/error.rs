//! Error types for ripcord-exec.

use thiserror::Error;

use ripcord_exchange::ExchangeError;
use ripcord_risk::BreakerError;
use ripcord_store::StoreError;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Circuit breaker rejected the call before any venue traffic.
    #[error("{0}")]
    CircuitOpen(#[from] BreakerError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Quantity floored to zero or notional under the venue minimum.
    /// A skip for the caller, never a venue failure.
    #[error("Exit below venue minimum: {0}")]
    BelowMinimum(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for execution operations.
pub type Result<T> = std::result::Result<T, ExecError>;
