//! Mock venue WebSocket server for integration tests.
//!
//! Speaks the op-based stream protocol:
//! - Acks auth, subscribe and unsubscribe ops
//! - Answers ping ops with pong
//! - Records received frames and can push topic frames to every client

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// A mock venue stream endpoint for testing.
pub struct MockExchangeWs {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    frames: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    push_tx: broadcast::Sender<String>,
    reject_auth: Arc<AtomicBool>,
}

impl MockExchangeWs {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (push_tx, _) = broadcast::channel::<String>(32);
        let reject_auth = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let frames_clone = frames.clone();
        let connections_clone = connections.clone();
        let push_clone = push_tx.clone();
        let reject_clone = reject_auth.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            frames_clone.clone(),
                            connections_clone.clone(),
                            push_clone.subscribe(),
                            reject_clone.clone(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            frames,
            connections,
            push_tx,
            reject_auth,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of connections received.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Get all received frames.
    pub async fn received_frames(&self) -> Vec<String> {
        self.frames.lock().await.iter().cloned().collect()
    }

    /// Push a frame to every connected client.
    pub fn push(&self, frame: String) {
        let _ = self.push_tx.send(frame);
    }

    /// Make subsequent auth ops fail.
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    frames: Arc<Mutex<VecDeque<String>>>,
    connections: Arc<Mutex<u32>>,
    mut push_rx: broadcast::Receiver<String>,
    reject_auth: Arc<AtomicBool>,
) {
    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            pushed = push_rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut queue = frames.lock().await;
                            queue.push_back(text.clone());
                        }
                        if let Some(reply) = reply_for(&text, &reject_auth) {
                            if write.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

/// Ack the ops the service sends, the way the venue would.
fn reply_for(text: &str, reject_auth: &AtomicBool) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    match parsed.get("op").and_then(|op| op.as_str())? {
        "auth" => {
            let success = !reject_auth.load(Ordering::SeqCst);
            Some(serde_json::json!({"op": "auth", "success": success}).to_string())
        }
        "subscribe" => Some(serde_json::json!({"op": "subscribe", "success": true}).to_string()),
        "unsubscribe" => {
            Some(serde_json::json!({"op": "unsubscribe", "success": true}).to_string())
        }
        "ping" => Some(serde_json::json!({"op": "pong"}).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockExchangeWs::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        server.shutdown().await;
    }
}
