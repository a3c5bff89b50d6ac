//! Per-user exchange API credentials.

use std::collections::HashMap;
use std::fmt;

use ripcord_core::{ExchangeId, UserId};

/// API key pair for one user on one exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub user_id: UserId,
    pub exchange: ExchangeId,
    pub api_key: String,
    pub api_secret: String,
    /// Inactive users are skipped by trigger fan-out and get no
    /// private connection.
    pub active: bool,
}

// Secrets must never reach logs, so Debug is written by hand.
impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("user_id", &self.user_id)
            .field("exchange", &self.exchange)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[redacted]")
            .field("active", &self.active)
            .finish()
    }
}

/// Credential lookup seam.
pub trait CredentialStore: Send + Sync {
    /// Credentials of every active user, fan-out order unspecified.
    fn active_users(&self) -> Vec<ApiCredentials>;

    /// Credentials for one user, active or not.
    fn get(&self, user: &UserId) -> Option<ApiCredentials>;
}

/// Credential store loaded once from configuration.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    by_user: HashMap<UserId, ApiCredentials>,
}

impl StaticCredentialStore {
    pub fn new(credentials: Vec<ApiCredentials>) -> Self {
        let by_user = credentials
            .into_iter()
            .map(|c| (c.user_id.clone(), c))
            .collect();
        Self { by_user }
    }
}

impl CredentialStore for StaticCredentialStore {
    fn active_users(&self) -> Vec<ApiCredentials> {
        let mut users: Vec<ApiCredentials> = self
            .by_user
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect();
        // Stable order keeps fan-out logs and tests readable.
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn get(&self, user: &UserId) -> Option<ApiCredentials> {
        self.by_user.get(user).cloned()
    }
}
