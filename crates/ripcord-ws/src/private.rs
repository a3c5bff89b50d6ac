//! Per-user private order stream.
//!
//! One authenticated connection per active trading user. The session
//! logs in with the signed challenge, subscribes to the `order` topic
//! and forwards every parsed event over an mpsc channel; persistence
//! happens in the supervisor's store-writer task so a slow write can
//! never stall this receive loop.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ripcord_core::{ExchangeId, UserId};
use ripcord_store::ApiCredentials;

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use crate::protocol::{InboundFrame, OpFrame, OrderEvent, ORDER_TOPIC};
use crate::supervisor::{backoff_delay, ConnectionState, WsConfig};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long to wait for the login ack before giving up on a session.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// One parsed order event tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub user_id: UserId,
    pub exchange: ExchangeId,
    pub event: OrderEvent,
}

/// Authenticated order stream for one user.
pub struct PrivateConnection {
    config: WsConfig,
    credentials: ApiCredentials,
    state: Arc<RwLock<ConnectionState>>,
    /// Shared with the supervisor's status snapshot; doubles as the
    /// attempt counter for backoff.
    reconnects: Arc<RwLock<u32>>,
    heartbeat: HeartbeatManager,
    update_tx: mpsc::Sender<OrderUpdate>,
    shutdown: CancellationToken,
}

impl PrivateConnection {
    pub fn new(
        config: WsConfig,
        credentials: ApiCredentials,
        state: Arc<RwLock<ConnectionState>>,
        reconnects: Arc<RwLock<u32>>,
        update_tx: mpsc::Sender<OrderUpdate>,
        shutdown: CancellationToken,
    ) -> Self {
        let heartbeat =
            HeartbeatManager::new(config.heartbeat_interval_ms, config.heartbeat_timeout_ms);
        Self {
            config,
            credentials,
            state,
            reconnects,
            heartbeat,
            update_tx,
            shutdown,
        }
    }

    /// Connect and reconnect until shutdown or the attempt bound.
    pub async fn run(self) -> WsResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                *self.state.write() = ConnectionState::Disconnected;
                return Ok(());
            }

            *self.state.write() = ConnectionState::Connecting;

            match self.session().await {
                Ok(()) => {
                    info!(user = %self.credentials.user_id, "Order stream closed");
                }
                Err(e) => {
                    warn!(user = %self.credentials.user_id, error = %e, "Order stream error");
                }
            }

            if self.shutdown.is_cancelled() {
                *self.state.write() = ConnectionState::Disconnected;
                return Ok(());
            }

            let attempt = {
                let mut attempts = self.reconnects.write();
                *attempts += 1;
                *attempts
            };

            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                *self.state.write() = ConnectionState::Disconnected;
                error!(user = %self.credentials.user_id, attempt, "Max reconnection attempts reached");
                return Err(WsError::ConnectionFailed(
                    "max reconnection attempts reached".to_string(),
                ));
            }

            *self.state.write() = ConnectionState::Disconnected;

            let delay = backoff_delay(&self.config, attempt);
            warn!(
                user = %self.credentials.user_id,
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting order stream"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => {
                    *self.state.write() = ConnectionState::Disconnected;
                    return Ok(());
                }
            }
        }
    }

    /// One connection lifetime: dial, authenticate, subscribe, pump.
    async fn session(&self) -> WsResult<()> {
        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.private_url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        *self.state.write() = ConnectionState::Connected;
        self.heartbeat.reset();

        self.authenticate(&mut write, &mut read).await?;
        *self.state.write() = ConnectionState::Authenticated;
        *self.reconnects.write() = 0;
        info!(user = %self.credentials.user_id, "Order stream authenticated");

        let subscribe = OpFrame::subscribe([ORDER_TOPIC.to_string()]);
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(user = %self.credentials.user_id, error = %e, "Close frame failed during shutdown");
                    }
                    *self.state.write() = ConnectionState::Disconnected;
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "normal close".to_string()));
                            warn!(user = %self.credentials.user_id, code, %reason, "Order stream closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        None => {
                            warn!(user = %self.credentials.user_id, "Order stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = self.heartbeat.wait_for_check() => {
                    if self.heartbeat.is_timed_out() {
                        return Err(WsError::HeartbeatTimeout);
                    }
                    if self.heartbeat.should_send_heartbeat() {
                        let ping = serde_json::to_string(&OpFrame::ping())?;
                        write.send(Message::Text(ping)).await?;
                        self.heartbeat.record_ping();
                    }
                }
            }
        }
    }

    /// Send the signed login frame and wait for its ack.
    ///
    /// Frames pushed before the ack are not expected from the venue
    /// and are skipped rather than treated as a protocol error.
    async fn authenticate(&self, write: &mut WsSink, read: &mut WsSource) -> WsResult<()> {
        let expires_ms = Utc::now().timestamp_millis() as u64 + self.config.auth_window_ms;
        let auth = OpFrame::auth(
            &self.credentials.api_key,
            &self.credentials.api_secret,
            expires_ms,
        );
        write
            .send(Message::Text(serde_json::to_string(&auth)?))
            .await?;

        let wait_for_ack = async {
            while let Some(msg) = read.next().await {
                match msg? {
                    Message::Text(text) => {
                        self.heartbeat.record_message();
                        let frame: InboundFrame = serde_json::from_str(&text)?;
                        if let InboundFrame::Ack(ack) = frame {
                            if ack.op == "auth" {
                                if ack.succeeded() {
                                    return Ok(());
                                }
                                return Err(WsError::AuthRejected(
                                    ack.ret_msg
                                        .unwrap_or_else(|| "login refused".to_string()),
                                ));
                            }
                        }
                    }
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, "closed during login".to_string()));
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    _ => {}
                }
            }
            Err(WsError::ConnectionClosed {
                code: 1006,
                reason: "stream ended during login".to_string(),
            })
        };

        match tokio::time::timeout(AUTH_TIMEOUT, wait_for_ack).await {
            Ok(result) => result,
            Err(_) => Err(WsError::AuthTimeout(AUTH_TIMEOUT)),
        }
    }

    async fn handle_text(&self, text: &str) -> WsResult<()> {
        self.heartbeat.record_message();

        let frame: InboundFrame = serde_json::from_str(text)?;
        match frame {
            InboundFrame::Ack(ack) => {
                if ack.is_pong() {
                    self.heartbeat.record_pong();
                } else if !ack.succeeded() {
                    warn!(
                        user = %self.credentials.user_id,
                        op = %ack.op,
                        msg = ?ack.ret_msg,
                        "Stream op refused"
                    );
                } else {
                    debug!(user = %self.credentials.user_id, op = %ack.op, "Stream op acknowledged");
                }
            }
            InboundFrame::Topic(topic) => {
                if !topic.is_order() {
                    debug!(topic = %topic.topic, "Ignoring frame for unexpected topic");
                    return Ok(());
                }
                let batch = topic.order_events();
                if batch.failed > 0 {
                    warn!(
                        user = %self.credentials.user_id,
                        failed = batch.failed,
                        "Order events dropped during parse"
                    );
                }
                for event in batch.events {
                    let update = OrderUpdate {
                        user_id: self.credentials.user_id.clone(),
                        exchange: self.credentials.exchange,
                        event,
                    };
                    if self.update_tx.send(update).await.is_err() {
                        warn!("Order update receiver dropped");
                    }
                }
            }
        }

        Ok(())
    }
}
