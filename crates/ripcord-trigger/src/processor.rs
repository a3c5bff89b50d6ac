//! Trigger fan-out orchestration.
//!
//! One inbound trigger is processed as: validate, dedup-claim, spawn
//! one task per active user, join all tasks, aggregate, release the
//! dedup claim. Per-user tasks are fully independent; a panic or error
//! in one shows up as that user's failed outcome and never cancels a
//! sibling.
//!
//! The batch counts as successful when at least one user actually
//! sold. Only then is the dedup cooldown armed, so a trigger that made
//! no progress anywhere can be retried immediately.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ripcord_core::{
    position_slot, split_symbol, ExchangeId, OrderType, Price, Qty, TriggerKind, UserId,
};
use ripcord_exchange::{with_retry, ExchangeRegistry, RetryPolicy};
use ripcord_exec::{ExecError, ExitExecutor, ExitFill, ExitRequest};
use ripcord_ledger::{ActiveEntry, PositionLedger};
use ripcord_store::{ApiCredentials, CredentialStore};
use ripcord_telemetry::Metrics;

use crate::dedup::{DedupRejection, TriggerDeduper};
use crate::error::{Result, TriggerError};
use crate::notifier::{notify_closed, notify_reduced, PositionClosed, PositionReduced, PositionSink};
use crate::payload::TriggerPayload;

// ============================================================================
// Configuration
// ============================================================================

/// Knobs for the fan-out pipeline.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Shared secret expected in every payload. `None` disables the
    /// check (local development only).
    pub webhook_secret: Option<String>,
    /// Minimum age of the entry fill before automated exits fire.
    pub warmup: Duration,
    /// Retry budget for the per-user balance fetch.
    pub balance_retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            warmup: Duration::from_secs(30 * 60),
            balance_retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Per-user outcomes
// ============================================================================

/// Why a user was skipped without an order attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No open entry remains for the symbol.
    PositionClosed,
    /// Entry filled too recently.
    WarmupPeriod,
    /// Free base balance at or below dust.
    NoBalance,
    /// Quantity floored to zero or notional under the venue minimum.
    BelowMinimum,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PositionClosed => "position_closed",
            Self::WarmupPeriod => "warmup_period",
            Self::NoBalance => "no_balance",
            Self::BelowMinimum => "below_minimum",
        }
    }
}

/// What happened to one user during fan-out.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UserOutcome {
    /// An exit order was placed and persisted.
    Sold {
        order_id: Uuid,
        order_type: OrderType,
        qty: Qty,
        fill_price: Price,
    },
    /// A guard decided there was nothing to do.
    Skipped { reason: SkipReason },
    /// Tried and failed. Never aborts siblings.
    Failed { reason: String },
}

impl UserOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sold { .. } => "sold",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    /// Bounded-cardinality reason label for metrics. Failure details
    /// are free-form text and stay out of label values.
    fn metric_reason(&self) -> &'static str {
        match self {
            Self::Sold { .. } => "ok",
            Self::Skipped { reason } => reason.as_str(),
            Self::Failed { .. } => "error",
        }
    }

    pub fn is_sold(&self) -> bool {
        matches!(self, Self::Sold { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// One user's slice of the batch result.
#[derive(Debug, Clone, Serialize)]
pub struct UserResult {
    pub user_id: UserId,
    pub exchange: ExchangeId,
    #[serde(flatten)]
    pub outcome: UserOutcome,
}

/// Batch result returned to the webhook caller.
///
/// Always delivered with HTTP 200 once the payload passed validation;
/// callers must read `users_sold`, not the status code, to learn
/// whether anything was executed.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerSummary {
    pub success: bool,
    pub users_processed: usize,
    pub users_sold: usize,
    pub users_failed: usize,
    pub results: Vec<UserResult>,
    pub message: String,
}

impl TriggerSummary {
    fn duplicate(rejection: &DedupRejection) -> Self {
        Self {
            success: false,
            users_processed: 0,
            users_sold: 0,
            users_failed: 0,
            results: Vec::new(),
            message: format!("duplicate trigger: {rejection}"),
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Fans one validated trigger out to every active user.
pub struct TriggerProcessor {
    config: ProcessorConfig,
    deduper: TriggerDeduper,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<ExchangeRegistry>,
    ledger: Arc<PositionLedger>,
    executor: Arc<ExitExecutor>,
    sink: Arc<dyn PositionSink>,
}

impl TriggerProcessor {
    pub fn new(
        config: ProcessorConfig,
        deduper: TriggerDeduper,
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<ExchangeRegistry>,
        ledger: Arc<PositionLedger>,
        executor: Arc<ExitExecutor>,
        sink: Arc<dyn PositionSink>,
    ) -> Self {
        Self {
            config,
            deduper,
            credentials,
            registry,
            ledger,
            executor,
            sink,
        }
    }

    /// Process one inbound trigger end to end.
    ///
    /// Errors only on auth or validation failure. Everything after
    /// that, including a batch where every user failed, comes back as
    /// an `Ok` summary.
    pub async fn process(&self, payload: TriggerPayload) -> Result<TriggerSummary> {
        let payload = payload.normalized();
        payload.validate(self.config.webhook_secret.as_deref())?;
        let base_asset = match split_symbol(&payload.symbol) {
            Ok((base, _)) => base.to_string(),
            Err(e) => return Err(TriggerError::Validation(e.to_string())),
        };

        let symbol = payload.symbol.clone();
        let kind = payload.trigger_type;
        Metrics::trigger_received(&symbol, kind.as_str());

        if let Err(rejection) = self.deduper.begin(&symbol, kind) {
            warn!(
                symbol = %symbol,
                kind = kind.as_str(),
                reason = rejection.as_str(),
                "Duplicate trigger rejected"
            );
            Metrics::trigger_duplicate(rejection.as_str());
            return Ok(TriggerSummary::duplicate(&rejection));
        }

        let started = Instant::now();
        let users = self.credentials.active_users();
        info!(
            symbol = %symbol,
            kind = kind.as_str(),
            users = users.len(),
            "Processing trigger"
        );

        let mut handles: Vec<(UserId, ExchangeId, JoinHandle<UserOutcome>)> =
            Vec::with_capacity(users.len());
        for creds in users {
            let user = creds.user_id.clone();
            let exchange = creds.exchange;
            let job = UserJob {
                creds,
                payload: payload.clone(),
                base_asset: base_asset.clone(),
                warmup: self.config.warmup,
                balance_retry: self.config.balance_retry,
                registry: Arc::clone(&self.registry),
                ledger: Arc::clone(&self.ledger),
                executor: Arc::clone(&self.executor),
                sink: Arc::clone(&self.sink),
            };
            handles.push((user, exchange, tokio::spawn(job.run())));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (user_id, exchange, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "User task aborted");
                    UserOutcome::Failed {
                        reason: format!("task aborted: {e}"),
                    }
                }
            };
            Metrics::user_outcome(outcome.as_str(), outcome.metric_reason());
            if let UserOutcome::Sold { order_type, .. } = &outcome {
                Metrics::exit_order_placed(exchange.as_str(), &order_type.to_string());
            }
            results.push(UserResult {
                user_id,
                exchange,
                outcome,
            });
        }

        let users_processed = results.len();
        let users_sold = results.iter().filter(|r| r.outcome.is_sold()).count();
        let users_failed = results.iter().filter(|r| r.outcome.is_failed()).count();
        let sold_any = users_sold > 0;

        // Cooldown arms only on real progress. A batch where nobody
        // sold leaves the key open for an immediate retry.
        self.deduper.complete(&symbol, kind, sold_any);

        let elapsed_ms = started.elapsed().as_millis() as f64;
        Metrics::trigger_duration(kind.as_str(), elapsed_ms);
        info!(
            symbol = %symbol,
            kind = kind.as_str(),
            users_processed,
            users_sold,
            users_failed,
            elapsed_ms,
            "Trigger complete"
        );

        Ok(TriggerSummary {
            success: sold_any,
            users_processed,
            users_sold,
            users_failed,
            results,
            message: format!("{users_sold}/{users_processed} users sold"),
        })
    }
}

// ============================================================================
// Per-user pipeline
// ============================================================================

/// Everything one spawned user task needs, owned so the task is
/// `'static`.
struct UserJob {
    creds: ApiCredentials,
    payload: TriggerPayload,
    base_asset: String,
    warmup: Duration,
    balance_retry: RetryPolicy,
    registry: Arc<ExchangeRegistry>,
    ledger: Arc<PositionLedger>,
    executor: Arc<ExitExecutor>,
    sink: Arc<dyn PositionSink>,
}

impl UserJob {
    async fn run(self) -> UserOutcome {
        let user = self.creds.user_id.clone();
        let exchange = self.creds.exchange;
        let symbol = self.payload.symbol.clone();

        let client = match self.registry.client_for(&self.creds) {
            Ok(client) => client,
            Err(e) => {
                warn!(user = %user, exchange = %exchange, error = %e, "No exchange client");
                return UserOutcome::Failed {
                    reason: format!("exchange client: {e}"),
                };
            }
        };

        // Balance fetch gets its own retry budget. Exhaustion fails
        // this user only.
        let balances =
            match with_retry(self.balance_retry, "balance_fetch", || client.balances()).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(user = %user, symbol = %symbol, error = %e, "Balance fetch failed");
                    return UserOutcome::Failed {
                        reason: format!("balance fetch: {e}"),
                    };
                }
            };
        let free = balances.free(&self.base_asset);

        let Some(active) = self.ledger.active_entry(&user, exchange, &symbol) else {
            debug!(user = %user, symbol = %symbol, "No open position");
            return UserOutcome::Skipped {
                reason: SkipReason::PositionClosed,
            };
        };

        let age = Utc::now()
            .signed_duration_since(active.entry.effective_fill_time())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.warmup {
            debug!(
                user = %user,
                symbol = %symbol,
                age_secs = age.as_secs(),
                "Entry inside warmup window"
            );
            return UserOutcome::Skipped {
                reason: SkipReason::WarmupPeriod,
            };
        }

        if free.inner() <= self.ledger.dust_tolerance().inner() {
            debug!(user = %user, symbol = %symbol, free = %free, "No sellable balance");
            return UserOutcome::Skipped {
                reason: SkipReason::NoBalance,
            };
        }

        // Sell the requested share of the wallet balance, capped at
        // what the ledger says is still open for this entry.
        let target = Qty::new(
            (free.inner() * self.payload.quantity_pct).min(active.remaining.inner()),
        );

        let request = ExitRequest {
            user_id: user.clone(),
            symbol: symbol.clone(),
            trigger: self.payload.trigger_type,
            qty: target,
            reference_price: self.payload.trigger_price,
            entry_id: active.entry.id,
            group_id: active.entry.group_id,
        };

        match self.executor.execute(&client, request).await {
            Ok(fill) => {
                self.report(&active, &fill);
                UserOutcome::Sold {
                    order_id: fill.order.id,
                    order_type: fill.order.order_type,
                    qty: fill.order.qty,
                    fill_price: fill.fill_price,
                }
            }
            Err(ExecError::BelowMinimum(detail)) => {
                debug!(user = %user, symbol = %symbol, detail = %detail, "Exit below venue minimum");
                UserOutcome::Skipped {
                    reason: SkipReason::BelowMinimum,
                }
            }
            Err(e) => {
                warn!(user = %user, symbol = %symbol, error = %e, "Exit failed");
                UserOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Tell the position tracker what just happened. Fire and forget.
    fn report(&self, active: &ActiveEntry, fill: &ExitFill) {
        let symbol = fill.order.symbol.clone();
        let slot_id = position_slot(&symbol);
        let sold = fill.order.qty;
        let reason = self.payload.trigger_type.as_str().to_string();

        if self.ledger.closes_position(active.remaining, sold) {
            notify_closed(
                Arc::clone(&self.sink),
                PositionClosed {
                    slot_id,
                    symbol,
                    exit_price: fill.fill_price,
                    exit_qty: sold,
                    realized_pnl: pnl_against_entry(active.entry.avg_fill_price, fill.fill_price, sold),
                    reason,
                },
            );
        } else {
            let qty_remaining = Qty::new(active.remaining.inner() - sold.inner());
            notify_reduced(
                Arc::clone(&self.sink),
                PositionReduced {
                    slot_id,
                    symbol,
                    current_price: fill.fill_price,
                    qty_remaining,
                    unrealized_pnl: pnl_against_entry(
                        active.entry.avg_fill_price,
                        fill.fill_price,
                        qty_remaining,
                    ),
                    update_type: reason,
                },
            );
        }
    }
}

/// PnL in quote units, or `None` when either side of the comparison is
/// unknown. A market order without an immediate fill reports price
/// zero until the stream corrects it; no number beats a wrong number.
fn pnl_against_entry(entry: Option<Price>, mark: Price, qty: Qty) -> Option<Decimal> {
    let entry = entry?;
    mark.is_positive()
        .then(|| (mark.inner() - entry.inner()) * qty.inner())
}
