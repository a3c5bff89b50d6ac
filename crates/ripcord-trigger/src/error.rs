//! Error types for the trigger pipeline.
//!
//! Only request-fatal conditions are errors here. Everything that goes
//! wrong for an individual user during fan-out is captured as that
//! user's outcome instead, so one account can never fail the batch.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// Webhook secret missing or wrong. Maps to HTTP 401.
    #[error("invalid webhook secret")]
    Auth,

    /// Payload shape is wrong. Maps to HTTP 400.
    #[error("invalid trigger payload: {0}")]
    Validation(String),
}

/// Errors from the downstream position sink.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned status {0}")]
    Status(u16),
}

pub type Result<T> = std::result::Result<T, TriggerError>;
