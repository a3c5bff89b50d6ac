//! Error types for ripcord-store.

use thiserror::Error;
use uuid::Uuid;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Order {0} already exists")]
    DuplicateOrder(Uuid),

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("No credentials for user {0}")]
    UnknownUser(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
