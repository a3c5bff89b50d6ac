//! Stream supervision.
//!
//! Owns one private order stream per active user plus the shared
//! ticker stream, restarts them with backoff, and funnels every order
//! event into the store through a single writer task. Status
//! snapshots for health reporting come from here.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ripcord_core::{ExchangeId, UserId};
use ripcord_store::{ApiCredentials, CredentialStore, OrderStore};

use crate::private::{OrderUpdate, PrivateConnection};
use crate::ticker::{TickerGuard, TickerReceiver, TickerStream};

/// Connection settings shared by the private and ticker streams.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Endpoint for authenticated per-user order streams.
    pub private_url: String,
    /// Endpoint for the shared ticker stream.
    pub ticker_url: String,
    /// 0 means reconnect forever.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// How far in the future the login challenge expiry is stamped.
    pub auth_window_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            private_url: String::new(),
            ticker_url: String::new(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            heartbeat_interval_ms: 20_000,
            heartbeat_timeout_ms: 60_000,
            auth_window_ms: 5_000,
        }
    }
}

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open; the private stream still has to log in.
    Connected,
    Authenticated,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exponential backoff with a small jitter, capped at the configured
/// maximum. Attempt numbering starts at 1.
pub(crate) fn backoff_delay(config: &WsConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay_ms = config
        .reconnect_base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.reconnect_max_delay_ms);
    Duration::from_millis(delay_ms.saturating_add(rand_jitter()))
}

fn rand_jitter() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 1_000)
        .unwrap_or(0)
}

struct UserHandle {
    exchange: ExchangeId,
    state: Arc<RwLock<ConnectionState>>,
    reconnects: Arc<RwLock<u32>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Snapshot of one user's order stream.
#[derive(Debug, Clone, Serialize)]
pub struct UserStreamStatus {
    pub user_id: UserId,
    pub exchange: ExchangeId,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

/// Snapshot of the shared ticker stream.
#[derive(Debug, Clone, Serialize)]
pub struct TickerStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub subscribed_symbols: Vec<String>,
}

/// Point-in-time view of every supervised stream.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub users: Vec<UserStreamStatus>,
    pub ticker: TickerStatus,
}

impl SupervisorStatus {
    pub fn authenticated_count(&self) -> usize {
        self.users
            .iter()
            .filter(|u| u.state == ConnectionState::Authenticated)
            .count()
    }
}

/// Owns and restarts every stream task.
pub struct ConnectionSupervisor {
    config: WsConfig,
    credentials: Arc<dyn CredentialStore>,
    store: Arc<dyn OrderStore>,
    users: RwLock<HashMap<UserId, UserHandle>>,
    ticker: Arc<TickerStream>,
    update_tx: mpsc::Sender<OrderUpdate>,
    /// Taken by `start_all`.
    update_rx: TokioMutex<Option<mpsc::Receiver<OrderUpdate>>>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        config: WsConfig,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn OrderStore>,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let ticker = Arc::new(TickerStream::new(config.clone(), shutdown.child_token()));
        Self {
            config,
            credentials,
            store,
            users: RwLock::new(HashMap::new()),
            ticker,
            update_tx,
            update_rx: TokioMutex::new(Some(update_rx)),
            shutdown,
        }
    }

    /// Spawn the store writer, the ticker stream and one private
    /// stream per active user. Idempotent for the background tasks;
    /// re-invoking restarts user streams.
    pub async fn start_all(&self) {
        if let Some(update_rx) = self.update_rx.lock().await.take() {
            let store = self.store.clone();
            let writer_token = self.shutdown.child_token();
            tokio::spawn(run_store_writer(update_rx, store, writer_token));

            let ticker = self.ticker.clone();
            tokio::spawn(async move {
                if let Err(e) = ticker.run().await {
                    error!(error = %e, "Ticker stream task failed");
                }
            });
        }

        let users = self.credentials.active_users();
        info!(users = users.len(), "Starting order streams");
        for credentials in users {
            self.start_user(credentials);
        }
    }

    /// Start (or restart) the order stream for one user.
    pub fn start_user(&self, credentials: ApiCredentials) {
        if !credentials.active {
            debug!(user = %credentials.user_id, "Skipping inactive user");
            return;
        }

        let user_id = credentials.user_id.clone();
        let exchange = credentials.exchange;
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let reconnects = Arc::new(RwLock::new(0u32));
        let token = self.shutdown.child_token();

        let connection = PrivateConnection::new(
            self.config.clone(),
            credentials,
            state.clone(),
            reconnects.clone(),
            self.update_tx.clone(),
            token.clone(),
        );
        let task_user = user_id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                error!(user = %task_user, error = %e, "Order stream task gave up");
            }
        });

        let handle = UserHandle {
            exchange,
            state,
            reconnects,
            token,
            task,
        };
        if let Some(old) = self.users.write().insert(user_id.clone(), handle) {
            info!(user = %user_id, "Replacing existing order stream");
            old.token.cancel();
            old.task.abort();
        }
    }

    /// Stop one user's order stream. Returns false when the user had
    /// no running stream.
    pub fn stop_user(&self, user: &UserId) -> bool {
        match self.users.write().remove(user) {
            Some(handle) => {
                info!(user = %user, "Stopping order stream");
                handle.token.cancel();
                handle.task.abort();
                true
            }
            None => false,
        }
    }

    /// Subscribe to one symbol's ticker on the shared stream.
    pub fn subscribe_ticker(&self, symbol: &str) -> (TickerGuard, TickerReceiver) {
        self.ticker.subscribe(symbol)
    }

    pub fn ticker_stream(&self) -> Arc<TickerStream> {
        self.ticker.clone()
    }

    /// Cancel every supervised task.
    pub fn shutdown(&self) {
        info!("Shutting down stream supervisor");
        self.shutdown.cancel();
    }

    /// Snapshot every stream for health reporting, users sorted by id.
    pub fn status(&self) -> SupervisorStatus {
        let mut users: Vec<UserStreamStatus> = self
            .users
            .read()
            .iter()
            .map(|(user_id, handle)| UserStreamStatus {
                user_id: user_id.clone(),
                exchange: handle.exchange,
                state: *handle.state.read(),
                reconnect_attempts: *handle.reconnects.read(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        SupervisorStatus {
            users,
            ticker: TickerStatus {
                state: self.ticker.state(),
                reconnect_attempts: self.ticker.reconnect_attempts(),
                subscribed_symbols: self.ticker.subscribed_symbols(),
            },
        }
    }
}

/// Drain order updates into the store until shutdown.
async fn run_store_writer(
    mut update_rx: mpsc::Receiver<OrderUpdate>,
    store: Arc<dyn OrderStore>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Store writer stopped");
                return;
            }
            update = update_rx.recv() => {
                let Some(update) = update else {
                    debug!("Order update channel closed");
                    return;
                };
                apply_order_update(store.as_ref(), &update);
            }
        }
    }
}

/// Apply one stream event to the store.
///
/// Extracted as separate function for testability.
fn apply_order_update(store: &dyn OrderStore, update: &OrderUpdate) {
    let execution = update.event.execution_update(update.exchange);
    match store.apply_execution(&execution) {
        Ok(true) => {
            debug!(
                user = %update.user_id,
                order_id = %update.event.order_id,
                status = %update.event.status,
                "Order record updated from stream"
            );
        }
        Ok(false) => {
            // Not one of ours: record it so a manual or external buy
            // becomes a sellable entry.
            let order = update.event.to_order(update.user_id.clone(), update.exchange);
            match store.insert(order) {
                Ok(()) => {
                    info!(
                        user = %update.user_id,
                        order_id = %update.event.order_id,
                        symbol = %update.event.symbol,
                        side = %update.event.side,
                        "Recorded externally placed order from stream"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to record external order");
                }
            }
        }
        Err(e) => {
            warn!(
                user = %update.user_id,
                order_id = %update.event.order_id,
                error = %e,
                "Order stream update failed to persist"
            );
        }
    }
}
