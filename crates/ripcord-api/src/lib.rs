//! HTTP surface for the ripcord exit-execution service.
//!
//! - `POST /webhook/trigger`: exit signals from the strategy
//! - `GET /healthz`: liveness plus a stream-supervisor snapshot
//! - `GET /metrics`: Prometheus scrape endpoint

pub mod server;

pub use server::{create_router, run_server, AppState};
