//! WebSocket streams for the ripcord exit-execution service.
//!
//! Provides the venue-facing stream layer with:
//! - One authenticated order stream per active user
//! - A shared ticker stream with ref-counted symbol subscriptions
//! - Automatic reconnection with exponential backoff
//! - Heartbeat monitoring with a silence timeout
//! - A single store-writer task behind every order stream

pub mod error;
pub mod heartbeat;
pub mod private;
pub mod protocol;
pub mod supervisor;
pub mod ticker;

pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;
pub use private::{OrderUpdate, PrivateConnection};
pub use protocol::{
    sign_challenge, ticker_symbol, ticker_topic, InboundFrame, OpAck, OpFrame, OrderEvent,
    OrderEventBatch, TickerEvent, TopicFrame, ORDER_TOPIC,
};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, SupervisorStatus, TickerStatus, UserStreamStatus,
    WsConfig,
};
pub use ticker::{TickerGuard, TickerReceiver, TickerStream};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
