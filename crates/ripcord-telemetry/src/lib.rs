//! Prometheus metrics and structured logging for ripcord.
//!
//! - Prometheus counters and gauges for the trigger pipeline, exit
//!   orders, breakers, and websocket health
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
