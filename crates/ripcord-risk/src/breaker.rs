//! Per-user circuit breaker around exchange calls.
//!
//! Keyed by (user, exchange) so one venue melting down for one user
//! never blocks anyone else. Transitions:
//!
//! CLOSED --threshold failures--> OPEN --recovery elapsed--> HALF_OPEN
//! HALF_OPEN --trial success--> CLOSED, --trial failure--> OPEN
//!
//! A success in CLOSED decays the failure count by one instead of
//! zeroing it, so a flapping venue that alternates success and failure
//! still trips eventually.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use ripcord_core::{ExchangeId, UserId};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BreakerError {
    #[error("Circuit open for {key}: retry in {retry_in_secs}s")]
    Open { key: String, retry_in_secs: u64 },

    #[error("Circuit half-open for {key}: trial call already in flight")]
    TrialInFlight { key: String },
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    failures: u32,
    tripped_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            tripped_at: None,
            trial_in_flight: false,
        }
    }
}

/// Keyed circuit breaker.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: DashMap<(UserId, ExchangeId), BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Whether a call may proceed for this key.
    ///
    /// In HALF_OPEN exactly one caller gets through; the slot is
    /// released by the matching `record_success`/`record_failure`.
    pub fn check(&self, user: &UserId, exchange: ExchangeId) -> Result<(), BreakerError> {
        let key = (user.clone(), exchange);
        let mut entry = self.entries.entry(key).or_default();

        if entry.state == BreakerState::Open {
            let elapsed = entry
                .tripped_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.recovery_timeout {
                info!(user = %user, exchange = %exchange, "circuit half-open, allowing trial call");
                entry.state = BreakerState::HalfOpen;
                entry.trial_in_flight = false;
            } else {
                let remaining = self.config.recovery_timeout - elapsed;
                return Err(BreakerError::Open {
                    key: format_key(user, exchange),
                    retry_in_secs: remaining.as_secs().max(1),
                });
            }
        }

        if entry.state == BreakerState::Closed {
            return Ok(());
        }

        // Half-open: hand out the single trial slot.
        if entry.trial_in_flight {
            Err(BreakerError::TrialInFlight {
                key: format_key(user, exchange),
            })
        } else {
            entry.trial_in_flight = true;
            Ok(())
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, user: &UserId, exchange: ExchangeId) {
        let key = (user.clone(), exchange);
        let mut entry = self.entries.entry(key).or_default();

        match entry.state {
            BreakerState::HalfOpen => {
                info!(user = %user, exchange = %exchange, "trial call succeeded, circuit closed");
                entry.state = BreakerState::Closed;
                entry.failures = 0;
                entry.tripped_at = None;
                entry.trial_in_flight = false;
            }
            _ => {
                entry.failures = entry.failures.saturating_sub(1);
            }
        }
    }

    /// Record a failed call (once per operation, after retries are
    /// exhausted, not per attempt).
    pub fn record_failure(&self, user: &UserId, exchange: ExchangeId) {
        let key = (user.clone(), exchange);
        let mut entry = self.entries.entry(key).or_default();

        match entry.state {
            BreakerState::HalfOpen => {
                warn!(user = %user, exchange = %exchange, "trial call failed, circuit re-opened");
                entry.state = BreakerState::Open;
                entry.tripped_at = Some(Instant::now());
                entry.trial_in_flight = false;
            }
            BreakerState::Closed => {
                entry.failures += 1;
                if entry.failures >= self.config.failure_threshold {
                    warn!(
                        user = %user,
                        exchange = %exchange,
                        failures = entry.failures,
                        "failure threshold reached, circuit opened"
                    );
                    entry.state = BreakerState::Open;
                    entry.tripped_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Give back a half-open trial slot without a verdict.
    ///
    /// Used when a checked operation ends before producing venue
    /// traffic (for example the exit was skipped as below-minimum):
    /// neither success nor failure applies, but the slot must not
    /// stay reserved forever.
    pub fn release_trial(&self, user: &UserId, exchange: ExchangeId) {
        if let Some(mut entry) = self.entries.get_mut(&(user.clone(), exchange)) {
            if entry.state == BreakerState::HalfOpen {
                entry.trial_in_flight = false;
            }
        }
    }

    /// Current state for a key; untouched keys are closed.
    pub fn state(&self, user: &UserId, exchange: ExchangeId) -> BreakerState {
        self.entries
            .get(&(user.clone(), exchange))
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Number of keys currently open or half-open. Health reporting.
    pub fn tripped_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != BreakerState::Closed)
            .count()
    }
}

fn format_key(user: &UserId, exchange: ExchangeId) -> String {
    format!("{user}/{exchange}")
}
