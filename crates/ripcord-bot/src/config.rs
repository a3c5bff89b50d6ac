//! Application configuration.
//!
//! TOML sections map one-to-one onto component configs. Secrets are
//! never written into the file: user keys, the webhook secret and the
//! notifier token all name environment variables that are resolved at
//! startup.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ripcord_core::{ExchangeId, UserId};
use ripcord_exchange::{ExchangeEndpoints, RetryPolicy};
use ripcord_risk::BreakerConfig;
use ripcord_store::ApiCredentials;
use ripcord_trigger::ProcessorConfig;
use ripcord_ws::WsConfig;

use crate::error::{AppError, AppResult};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Webhook/health/metrics port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Trigger pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Environment variable holding the shared webhook secret.
    /// Unset disables the check (local development only).
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
    /// Minimum age of an entry fill before automated exits fire.
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// Dedup cooldown after a trigger that sold for anyone.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_warmup_secs() -> u64 {
    1_800
}

fn default_cooldown_secs() -> u64 {
    1_800
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            webhook_secret_env: None,
            warmup_secs: default_warmup_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Exit executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Attempts per REST call (balance fetch and order submission).
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base delay between attempts, doubled each retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How long cached symbol rules stay fresh.
    #[serde(default = "default_rules_ttl_secs")]
    pub rules_ttl_secs: u64,
    /// Residual base quantity treated as a closed position.
    #[serde(default = "default_dust_tolerance")]
    pub dust_tolerance: Decimal,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_rules_ttl_secs() -> u64 {
    300
}

fn default_dust_tolerance() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            rules_ttl_secs: default_rules_ttl_secs(),
            dust_tolerance: default_dust_tolerance(),
        }
    }
}

impl ExecutorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures that trip one user/exchange breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open time before a trial call is allowed.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl From<BreakerSection> for BreakerConfig {
    fn from(cfg: BreakerSection) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            recovery_timeout: Duration::from_secs(cfg.recovery_timeout_secs),
        }
    }
}

/// WebSocket configuration subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSection {
    /// Endpoint for authenticated per-user order streams.
    #[serde(default)]
    pub private_url: String,
    /// Endpoint for the shared ticker stream.
    #[serde(default)]
    pub ticker_url: String,
    /// Maximum reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_auth_window_ms")]
    pub auth_window_ms: u64,
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_auth_window_ms() -> u64 {
    5_000
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            private_url: String::new(),
            ticker_url: String::new(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            auth_window_ms: default_auth_window_ms(),
        }
    }
}

impl From<WsSection> for WsConfig {
    fn from(cfg: WsSection) -> Self {
        Self {
            private_url: cfg.private_url,
            ticker_url: cfg.ticker_url,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            auth_window_ms: cfg.auth_window_ms,
        }
    }
}

/// Position tracker notifier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Tracker base URL. Unset means notifications are dropped.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the tracker bearer token.
    #[serde(default)]
    pub bearer_token_env: Option<String>,
}

/// REST endpoints for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub rest_url: String,
    /// Signed-request tolerance for clock drift, in milliseconds.
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
}

fn default_recv_window_ms() -> u64 {
    5_000
}

impl From<VenueConfig> for ExchangeEndpoints {
    fn from(cfg: VenueConfig) -> Self {
        Self {
            rest_url: cfg.rest_url,
            recv_window_ms: cfg.recv_window_ms,
        }
    }
}

/// Venue endpoint table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangesConfig {
    #[serde(default)]
    pub binance: Option<VenueConfig>,
    #[serde(default)]
    pub bybit: Option<VenueConfig>,
}

/// One trading user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub exchange: ExchangeId,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Environment variable holding the API secret.
    pub api_secret_env: String,
    #[serde(default = "default_user_active")]
    pub active: bool,
}

fn default_user_active() -> bool {
    true
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub ws: WsSection,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl AppConfig {
    /// Load configuration from file.
    pub fn load() -> AppResult<Self> {
        let config_path =
            std::env::var("RIPCORD_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Resolve every configured user's API keys from the environment.
    ///
    /// A named variable that is missing is an error; silently starting
    /// a user without keys would only surface at the first trigger.
    pub fn resolve_credentials(&self) -> AppResult<Vec<ApiCredentials>> {
        self.users
            .iter()
            .map(|user| {
                Ok(ApiCredentials {
                    user_id: UserId::from(user.id.as_str()),
                    exchange: user.exchange,
                    api_key: require_env(&user.api_key_env)?,
                    api_secret: require_env(&user.api_secret_env)?,
                    active: user.active,
                })
            })
            .collect()
    }

    /// Shared webhook secret, when configured.
    pub fn webhook_secret(&self) -> AppResult<Option<String>> {
        self.trigger
            .webhook_secret_env
            .as_deref()
            .map(require_env)
            .transpose()
    }

    /// Notifier bearer token, when configured.
    pub fn bearer_token(&self) -> AppResult<Option<String>> {
        self.notifier
            .bearer_token_env
            .as_deref()
            .map(require_env)
            .transpose()
    }

    pub fn processor_config(&self) -> AppResult<ProcessorConfig> {
        Ok(ProcessorConfig {
            webhook_secret: self.webhook_secret()?,
            warmup: Duration::from_secs(self.trigger.warmup_secs),
            balance_retry: self.executor.retry_policy(),
        })
    }

    pub fn dedup_cooldown(&self) -> Duration {
        Duration::from_secs(self.trigger.cooldown_secs)
    }

    pub fn ws_config(&self) -> WsConfig {
        self.ws.clone().into()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        self.breaker.clone().into()
    }

    pub fn endpoints(&self) -> (Option<ExchangeEndpoints>, Option<ExchangeEndpoints>) {
        (
            self.exchanges.binance.clone().map(Into::into),
            self.exchanges.bybit.clone().map(Into::into),
        )
    }
}

fn require_env(name: &str) -> AppResult<String> {
    std::env::var(name)
        .map_err(|_| AppError::Config(format!("Environment variable {name} is not set")))
}
