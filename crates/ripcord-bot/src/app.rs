//! Application wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ripcord_api::{run_server, AppState};
use ripcord_core::Qty;
use ripcord_exchange::{ExchangeRegistry, RulesCache};
use ripcord_exec::ExitExecutor;
use ripcord_ledger::PositionLedger;
use ripcord_risk::CircuitBreaker;
use ripcord_store::{CredentialStore, MemoryOrderStore, OrderStore, StaticCredentialStore};
use ripcord_telemetry::Metrics;
use ripcord_trigger::{
    HttpPositionSink, NoopSink, PositionSink, TriggerDeduper, TriggerProcessor,
};
use ripcord_ws::ConnectionSupervisor;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

/// Fully wired application.
///
/// Construction resolves secrets and builds every component; `run`
/// starts the streams and serves HTTP until shutdown.
pub struct Application {
    config: AppConfig,
    processor: Arc<TriggerProcessor>,
    supervisor: Arc<ConnectionSupervisor>,
    breaker: Arc<CircuitBreaker>,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let credentials = config.resolve_credentials()?;
        info!(users = credentials.len(), "Loaded user credentials");

        let credential_store: Arc<dyn CredentialStore> =
            Arc::new(StaticCredentialStore::new(credentials));
        let store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());

        let (binance, bybit) = config.endpoints();
        let registry = Arc::new(ExchangeRegistry::new(binance, bybit));

        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let rules = Arc::new(RulesCache::new(Duration::from_secs(
            config.executor.rules_ttl_secs,
        )));
        let executor = Arc::new(ExitExecutor::new(
            store.clone(),
            breaker.clone(),
            rules,
            config.executor.retry_policy(),
        ));
        let ledger = Arc::new(PositionLedger::new(
            store.clone(),
            Qty::new(config.executor.dust_tolerance),
        ));

        let sink: Arc<dyn PositionSink> = match &config.notifier.base_url {
            Some(url) => Arc::new(
                HttpPositionSink::new(url.clone(), config.bearer_token()?)
                    .map_err(|e| AppError::Config(format!("Failed to build notifier: {e}")))?,
            ),
            None => {
                info!("No tracker URL configured, position notifications disabled");
                Arc::new(NoopSink)
            }
        };

        let processor = Arc::new(TriggerProcessor::new(
            config.processor_config()?,
            TriggerDeduper::new(config.dedup_cooldown()),
            credential_store.clone(),
            registry,
            ledger,
            executor,
            sink,
        ));

        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.ws_config(),
            credential_store,
            store,
        ));

        Ok(Self {
            config,
            processor,
            supervisor,
            breaker,
        })
    }

    /// Run until Ctrl+C or a fatal server error.
    pub async fn run(self) -> AppResult<()> {
        self.supervisor.start_all().await;

        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        tokio::spawn(run_status_loop(
            self.supervisor.clone(),
            self.breaker.clone(),
            shutdown.child_token(),
        ));

        let state = AppState::new(self.processor.clone(), self.supervisor.clone());
        run_server(state, self.config.server.port, shutdown.clone())
            .await
            .map_err(|e| AppError::Server(e.to_string()))?;

        self.supervisor.shutdown();
        info!("Application stopped");
        Ok(())
    }
}

/// Publish stream and breaker state as gauges every ten seconds.
async fn run_status_loop(
    supervisor: Arc<ConnectionSupervisor>,
    breaker: Arc<CircuitBreaker>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let status = supervisor.status();
                Metrics::ws_private_connections(status.authenticated_count() as i64);
                for user in &status.users {
                    Metrics::ws_reconnect_attempts(
                        user.user_id.as_str(),
                        f64::from(user.reconnect_attempts),
                    );
                }
                Metrics::breakers_open(breaker.tripped_count() as i64);
            }
        }
    }
}
