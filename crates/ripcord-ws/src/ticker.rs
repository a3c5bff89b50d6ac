//! Shared market ticker stream.
//!
//! One connection serves every consumer in the process. Symbol
//! subscriptions are reference-counted through RAII guards: the
//! subscribe frame goes out when a symbol gains its first consumer,
//! the unsubscribe frame only when the last guard drops. The
//! connection itself is demand-driven, opened once any guard exists
//! and closed again when the total guard count reaches zero.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use crate::protocol::{ticker_symbol, ticker_topic, InboundFrame, OpFrame, TickerEvent};
use crate::supervisor::{backoff_delay, ConnectionState, WsConfig};

/// Latest tick per consumer, `None` until the first tick arrives.
pub type TickerReceiver = watch::Receiver<Option<TickerEvent>>;

struct TopicEntry {
    refs: usize,
    tx: watch::Sender<Option<TickerEvent>>,
}

/// State shared between the stream task and the guards.
struct Shared {
    topics: Mutex<HashMap<String, TopicEntry>>,
    outbound_tx: mpsc::Sender<String>,
    /// Total live guard count; the stream task watches it to decide
    /// when the connection is needed at all.
    demand_tx: watch::Sender<usize>,
}

/// Keeps one symbol subscription alive while held.
pub struct TickerGuard {
    shared: Arc<Shared>,
    topic: String,
}

impl Drop for TickerGuard {
    fn drop(&mut self) {
        let mut topics = self.shared.topics.lock();
        if let Some(entry) = topics.get_mut(&self.topic) {
            entry.refs -= 1;
            if entry.refs == 0 {
                topics.remove(&self.topic);
                let frame = OpFrame::unsubscribe([self.topic.clone()]);
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = self.shared.outbound_tx.try_send(text);
                }
                debug!(topic = %self.topic, "Last consumer left, unsubscribed");
            }
        }
        drop(topics);
        self.shared.demand_tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

enum SessionEnd {
    Shutdown,
    /// Guard count hit zero; the connection was closed on purpose.
    Drained,
}

/// Shared ticker connection with ref-counted symbol subscriptions.
pub struct TickerStream {
    config: WsConfig,
    state: Arc<RwLock<ConnectionState>>,
    reconnects: Arc<RwLock<u32>>,
    shared: Arc<Shared>,
    /// Taken by the first `run` call.
    outbound_rx: TokioMutex<Option<mpsc::Receiver<String>>>,
    demand_rx: watch::Receiver<usize>,
    heartbeat: HeartbeatManager,
    shutdown: CancellationToken,
}

impl TickerStream {
    pub fn new(config: WsConfig, shutdown: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (demand_tx, demand_rx) = watch::channel(0usize);
        let heartbeat =
            HeartbeatManager::new(config.heartbeat_interval_ms, config.heartbeat_timeout_ms);
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconnects: Arc::new(RwLock::new(0)),
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                outbound_tx,
                demand_tx,
            }),
            outbound_rx: TokioMutex::new(Some(outbound_rx)),
            demand_rx,
            heartbeat,
            shutdown,
        }
    }

    /// Subscribe to one symbol's ticker.
    ///
    /// The subscription stays active until the returned guard drops.
    /// The receiver holds `None` until the first tick arrives.
    pub fn subscribe(&self, symbol: &str) -> (TickerGuard, TickerReceiver) {
        let topic = ticker_topic(symbol);
        let mut topics = self.shared.topics.lock();
        let entry = topics.entry(topic.clone()).or_insert_with(|| {
            let (tx, _rx) = watch::channel(None);
            TopicEntry { refs: 0, tx }
        });
        if entry.refs == 0 {
            let frame = OpFrame::subscribe([topic.clone()]);
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = self.shared.outbound_tx.try_send(text);
            }
            debug!(topic = %topic, "First consumer, subscribing");
        }
        entry.refs += 1;
        let receiver = entry.tx.subscribe();
        drop(topics);
        self.shared.demand_tx.send_modify(|n| *n += 1);

        (
            TickerGuard {
                shared: self.shared.clone(),
                topic,
            },
            receiver,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        *self.reconnects.read()
    }

    /// Symbols with at least one live consumer, sorted.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .shared
            .topics
            .lock()
            .keys()
            .filter_map(|topic| ticker_symbol(topic).map(str::to_string))
            .collect();
        symbols.sort();
        symbols
    }

    /// Drive the connection until shutdown.
    ///
    /// Idles while no consumer exists, dials when demand appears and
    /// reconnects with backoff on failure.
    pub async fn run(self: Arc<Self>) -> WsResult<()> {
        let Some(mut outbound_rx) = self.outbound_rx.lock().await.take() else {
            return Err(WsError::ConnectionFailed(
                "ticker stream already running".to_string(),
            ));
        };
        let mut demand_rx = self.demand_rx.clone();

        loop {
            if self.shutdown.is_cancelled() {
                *self.state.write() = ConnectionState::Disconnected;
                return Ok(());
            }

            if *demand_rx.borrow_and_update() == 0 {
                *self.state.write() = ConnectionState::Disconnected;
                tokio::select! {
                    () = self.shutdown.cancelled() => {
                        return Ok(());
                    }
                    changed = demand_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            *self.state.write() = ConnectionState::Connecting;

            match self.session(&mut outbound_rx, &mut demand_rx).await {
                Ok(SessionEnd::Shutdown) => {
                    *self.state.write() = ConnectionState::Disconnected;
                    return Ok(());
                }
                Ok(SessionEnd::Drained) => {
                    info!("Ticker stream closed, no consumers left");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Ticker stream error");
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
                return Err(WsError::ConnectionFailed(
                    "max reconnection attempts reached".to_string(),
                ));
            }

            *self.state.write() = ConnectionState::Disconnected;

            let delay = backoff_delay(&self.config, attempt);
            warn!(attempt, delay_ms = delay.as_millis(), "Reconnecting ticker stream");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => {
                    *self.state.write() = ConnectionState::Disconnected;
                    return Ok(());
                }
            }
        }
    }

    async fn session(
        &self,
        outbound_rx: &mut mpsc::Receiver<String>,
        demand_rx: &mut watch::Receiver<usize>,
    ) -> WsResult<SessionEnd> {
        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.ticker_url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        *self.state.write() = ConnectionState::Connected;
        self.heartbeat.reset();

        // Frames queued while disconnected are superseded by the
        // replay below; the topic map is the authoritative set.
        while outbound_rx.try_recv().is_ok() {}

        let topics: Vec<String> = self.shared.topics.lock().keys().cloned().collect();
        if !topics.is_empty() {
            let count = topics.len();
            let frame = OpFrame::subscribe(topics);
            write
                .send(Message::Text(serde_json::to_string(&frame)?))
                .await?;
            info!(subscriptions = count, "Ticker stream connected, replayed subscriptions");
        } else {
            info!("Ticker stream connected");
        }
        *self.reconnects.write() = 0;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "Close frame failed during shutdown");
                    }
                    return Ok(SessionEnd::Shutdown);
                }

                changed = demand_rx.changed() => {
                    if changed.is_err() || *demand_rx.borrow_and_update() == 0 {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Drained);
                    }
                }

                outbound = outbound_rx.recv() => {
                    if let Some(text) = outbound {
                        write.send(Message::Text(text)).await?;
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(&text)?;
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
                            warn!(code, %reason, "Ticker stream closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            return Err(e.into());
                        }
                        None => {
                            warn!("Ticker stream ended");
                            return Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            });
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

    fn dispatch(&self, text: &str) -> WsResult<()> {
        self.heartbeat.record_message();

        let frame: InboundFrame = serde_json::from_str(text)?;
        match frame {
            InboundFrame::Ack(ack) => {
                if ack.is_pong() {
                    self.heartbeat.record_pong();
                } else if !ack.succeeded() {
                    warn!(op = %ack.op, msg = ?ack.ret_msg, "Ticker op refused");
                }
            }
            InboundFrame::Topic(topic) => {
                let Some(tick) = topic.ticker() else {
                    debug!(topic = %topic.topic, "Ignoring frame for unexpected topic");
                    return Ok(());
                };
                let topics = self.shared.topics.lock();
                if let Some(entry) = topics.get(&topic.topic) {
                    entry.tx.send_replace(Some(tick));
                }
                // Ticks for a symbol unsubscribed mid-flight are dropped.
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stream() -> TickerStream {
        TickerStream::new(WsConfig::default(), CancellationToken::new())
    }

    fn queued_frames(stream: &TickerStream) -> Vec<String> {
        let mut frames = Vec::new();
        let mut guard = stream.outbound_rx.try_lock().unwrap();
        let rx = guard.as_mut().unwrap();
        while let Ok(text) = rx.try_recv() {
            frames.push(text);
        }
        frames
    }

    #[tokio::test]
    async fn test_subscribe_is_refcounted() {
        let stream = stream();

        let (g1, _rx1) = stream.subscribe("BTCUSDT");
        let (g2, _rx2) = stream.subscribe("BTCUSDT");
        assert_eq!(stream.subscribed_symbols(), vec!["BTCUSDT"]);
        assert_eq!(*stream.demand_rx.borrow(), 2);

        // Only the first consumer produced a subscribe frame.
        let frames = queued_frames(&stream);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""op":"subscribe""#));
        assert!(frames[0].contains("tickers.BTCUSDT"));

        drop(g1);
        assert_eq!(stream.subscribed_symbols(), vec!["BTCUSDT"]);
        assert!(queued_frames(&stream).is_empty());

        drop(g2);
        assert!(stream.subscribed_symbols().is_empty());
        assert_eq!(*stream.demand_rx.borrow(), 0);
        let frames = queued_frames(&stream);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""op":"unsubscribe""#));
    }

    #[tokio::test]
    async fn test_distinct_symbols_subscribe_independently() {
        let stream = stream();

        let (_g1, _rx1) = stream.subscribe("BTCUSDT");
        let (_g2, _rx2) = stream.subscribe("ETHUSDT");

        assert_eq!(stream.subscribed_symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(queued_frames(&stream).len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_routes_tick_to_watchers() {
        let stream = stream();
        let (_guard, mut rx) = stream.subscribe("BTCUSDT");
        assert!(rx.borrow().is_none());

        stream
            .dispatch(
                r#"{"topic":"tickers.BTCUSDT","ts":1700000000000,"data":{"symbol":"BTCUSDT","lastPrice":"50123.5"}}"#,
            )
            .unwrap();

        let tick = rx.borrow_and_update().clone().unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.last_price, dec!(50123.5));

        // A tick for a symbol nobody holds is dropped quietly.
        stream
            .dispatch(
                r#"{"topic":"tickers.XRPUSDT","ts":1700000000000,"data":{"symbol":"XRPUSDT","lastPrice":"0.5"}}"#,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_records_pong() {
        let stream = stream();
        stream.heartbeat.record_ping();
        stream.dispatch(r#"{"op":"pong"}"#).unwrap();
        assert!(stream.heartbeat.time_since_last_message_ms() < 1_000);
        assert!(!stream.heartbeat.is_timed_out());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_malformed_frame() {
        let stream = stream();
        assert!(stream.dispatch("not json").is_err());
    }
}
