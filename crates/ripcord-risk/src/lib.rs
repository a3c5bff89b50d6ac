//! Risk controls for exchange calls.

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
