//! Stream lifecycle integration tests.
//!
//! Runs the connection supervisor against a mock venue endpoint:
//! - Authentication and order topic subscription
//! - Order event persistence through the store writer
//! - Reconnect bounds and the demand-driven ticker lifecycle

mod integration;
use integration::common::mock_ws::MockExchangeWs;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use ripcord_core::{ExchangeId, UserId};
use ripcord_store::{
    ApiCredentials, CredentialStore, MemoryOrderStore, OrderStore, StaticCredentialStore,
};
use ripcord_ws::{ConnectionState, ConnectionSupervisor, WsConfig};

fn ws_config(server: &MockExchangeWs) -> WsConfig {
    WsConfig {
        private_url: server.url(),
        ticker_url: server.url(),
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 100,
        ..WsConfig::default()
    }
}

fn user(id: &str) -> ApiCredentials {
    ApiCredentials {
        user_id: UserId::from(id),
        exchange: ExchangeId::Bybit,
        api_key: format!("{id}-key"),
        api_secret: format!("{id}-secret"),
        active: true,
    }
}

async fn wait_for_auth(supervisor: &ConnectionSupervisor, expected: usize) {
    let authenticated = timeout(Duration::from_secs(2), async {
        loop {
            if supervisor.status().authenticated_count() == expected {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(authenticated.is_ok(), "Should authenticate within timeout");
}

/// Test that the supervisor logs in and subscribes the order topic.
#[tokio::test]
async fn test_supervisor_authenticates_order_stream() {
    let server = MockExchangeWs::start().await;

    let store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(StaticCredentialStore::new(vec![user("u1")]));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        ws_config(&server),
        credentials,
        store,
    ));

    supervisor.start_all().await;
    wait_for_auth(&supervisor, 1).await;

    let frames = server.received_frames().await;
    assert!(
        frames.iter().any(|f| f.contains(r#""op":"auth""#)),
        "Should have sent an auth op"
    );
    assert!(
        frames
            .iter()
            .any(|f| f.contains(r#""op":"subscribe""#) && f.contains("order")),
        "Should have subscribed the order topic"
    );

    supervisor.shutdown();
    server.shutdown().await;
}

/// Test that a pushed fill for an order placed outside the service is
/// persisted as a sellable entry.
#[tokio::test]
async fn test_order_stream_records_foreign_buy() {
    let server = MockExchangeWs::start().await;

    let store = Arc::new(MemoryOrderStore::new());
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(StaticCredentialStore::new(vec![user("u1")]));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        ws_config(&server),
        credentials,
        store.clone(),
    ));

    supervisor.start_all().await;
    wait_for_auth(&supervisor, 1).await;

    server.push(
        serde_json::json!({
            "topic": "order",
            "ts": 1_700_000_000_000u64,
            "data": [{
                "orderId": "EXT-1",
                "symbol": "BTCUSDT",
                "side": "buy",
                "orderType": "market",
                "status": "FILLED",
                "qty": "0.5",
                "executedQty": "0.5",
                "cumulativeQuote": "22500",
                "updatedAt": 1_700_000_000_000u64
            }]
        })
        .to_string(),
    );

    let entries = timeout(Duration::from_secs(2), async {
        loop {
            let entries =
                store.filled_entries(&UserId::from("u1"), ExchangeId::Bybit, "BTCUSDT");
            if !entries.is_empty() {
                return entries;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("fill should be recorded within timeout");

    assert_eq!(entries[0].exchange_order_id.as_deref(), Some("EXT-1"));

    supervisor.shutdown();
    server.shutdown().await;
}

/// Test that a stream whose login is refused stops after the attempt
/// bound instead of hammering the endpoint.
#[tokio::test]
async fn test_rejected_auth_stops_after_max_attempts() {
    let server = MockExchangeWs::start().await;
    server.set_reject_auth(true);

    let config = WsConfig {
        max_reconnect_attempts: 2,
        ..ws_config(&server)
    };
    let store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(StaticCredentialStore::new(vec![user("u1")]));
    let supervisor = Arc::new(ConnectionSupervisor::new(config, credentials, store));

    supervisor.start_all().await;

    let gave_up = timeout(Duration::from_secs(5), async {
        loop {
            let status = supervisor.status();
            let user = &status.users[0];
            if user.state == ConnectionState::Disconnected && user.reconnect_attempts >= 2 {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    assert!(gave_up.is_ok(), "Stream should give up after max attempts");
    assert_eq!(supervisor.status().authenticated_count(), 0);

    supervisor.shutdown();
    server.shutdown().await;
}

/// Test that the ticker stream dials only while consumers exist.
#[tokio::test]
async fn test_ticker_dials_on_demand_and_drains() {
    let server = MockExchangeWs::start().await;

    let store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
    let credentials: Arc<dyn CredentialStore> = Arc::new(StaticCredentialStore::new(Vec::new()));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        ws_config(&server),
        credentials,
        store,
    ));

    supervisor.start_all().await;

    // No users and no ticker interest: nothing should dial out.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count().await, 0);

    let (guard, mut ticks) = supervisor.subscribe_ticker("BTCUSDT");

    let subscribed = timeout(Duration::from_secs(2), async {
        loop {
            let frames = server.received_frames().await;
            if frames.iter().any(|f| f.contains("tickers.BTCUSDT")) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(subscribed.is_ok(), "Ticker should dial once demand appears");
    assert_eq!(server.connection_count().await, 1);

    server.push(
        serde_json::json!({
            "topic": "tickers.BTCUSDT",
            "ts": 1_700_000_000_000u64,
            "data": {"symbol": "BTCUSDT", "lastPrice": "50123.5"}
        })
        .to_string(),
    );

    let tick = timeout(Duration::from_secs(2), async {
        loop {
            if ticks.changed().await.is_err() {
                panic!("tick channel closed");
            }
            let latest = ticks.borrow().clone();
            if let Some(tick) = latest {
                return tick;
            }
        }
    })
    .await
    .expect("tick should arrive within timeout");
    assert_eq!(tick.symbol, "BTCUSDT");

    // Last guard dropped: the stream should hang up.
    drop(guard);
    let drained = timeout(Duration::from_secs(2), async {
        loop {
            if supervisor.status().ticker.state == ConnectionState::Disconnected {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "Ticker should drain once the last guard drops");

    // New interest dials a fresh connection.
    let (guard2, _ticks2) = supervisor.subscribe_ticker("ETHUSDT");
    let redialed = timeout(Duration::from_secs(2), async {
        loop {
            if server.connection_count().await == 2 {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(redialed.is_ok(), "Ticker should dial again for new demand");

    drop(guard2);
    supervisor.shutdown();
    server.shutdown().await;
}

/// Test that shutdown stops every stream.
#[tokio::test]
async fn test_shutdown_disconnects_streams() {
    let server = MockExchangeWs::start().await;

    let store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(StaticCredentialStore::new(vec![user("u1")]));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        ws_config(&server),
        credentials,
        store,
    ));

    supervisor.start_all().await;
    wait_for_auth(&supervisor, 1).await;

    supervisor.shutdown();

    let stopped = timeout(Duration::from_secs(2), async {
        loop {
            let status = supervisor.status();
            if status
                .users
                .iter()
                .all(|u| u.state == ConnectionState::Disconnected)
            {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "Streams should stop after shutdown");

    server.shutdown().await;
}
