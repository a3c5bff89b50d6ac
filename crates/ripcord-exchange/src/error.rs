//! Exchange error taxonomy.
//!
//! The split that matters operationally is retryable versus not: a
//! timeout may be retried, an insufficient-balance rejection must not
//! be. Everything downstream (retry loop, circuit breaker, per-user
//! outcomes) keys off [`ExchangeError::is_retryable`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Connection-level failure (DNS, TLS, reset).
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// HTTP 429/418 or a venue rate-limit code.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Venue-side 5xx.
    #[error("Exchange unavailable (HTTP {status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Unknown or untradable symbol: {0}")]
    InvalidSymbol(String),

    #[error("Order notional below venue minimum: {0}")]
    NotionalTooSmall(String),

    /// Venue rejected the request with a code not mapped above.
    #[error("Exchange rejected request (code {code}): {message}")]
    Api { code: i64, message: String },

    /// No endpoints configured for the venue.
    #[error("Exchange not configured: {0}")]
    NotConfigured(String),

    #[error("Malformed exchange response: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Whether a retry has any chance of succeeding. Only the
    /// transport class qualifies; venue rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Result type alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
