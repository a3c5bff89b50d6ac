//! Outbound notifications to the position-tracking service.
//!
//! Everything here is best-effort. A dead or slow tracker must never
//! hold up trigger processing, so callers go through [`notify_closed`]
//! and [`notify_reduced`], which detach the delivery onto its own task
//! and only log failures.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use ripcord_core::{Price, Qty};
use ripcord_telemetry::Metrics;

use crate::error::NotifyError;

/// Timeout for calls to the position tracker.
const SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// A position was fully closed by an exit.
///
/// `slot_id` comes from [`ripcord_core::position_slot`], so every exit
/// for the same symbol lands on the same tracker slot regardless of
/// which order closed it.
#[derive(Debug, Clone, Serialize)]
pub struct PositionClosed {
    pub slot_id: u32,
    pub symbol: String,
    pub exit_price: Price,
    pub exit_qty: Qty,
    /// Realized profit in quote units, when the entry fill price is
    /// known. Absent otherwise rather than a fabricated zero.
    pub realized_pnl: Option<Decimal>,
    /// Close reason in trigger wire form, e.g. "SL_HIT".
    pub reason: String,
}

/// A position was partially exited and remains open.
#[derive(Debug, Clone, Serialize)]
pub struct PositionReduced {
    pub slot_id: u32,
    pub symbol: String,
    pub current_price: Price,
    pub qty_remaining: Qty,
    pub unrealized_pnl: Option<Decimal>,
    /// Update kind in trigger wire form, e.g. "TP1_HIT".
    pub update_type: String,
}

/// Destination for position lifecycle events.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn position_closed(&self, event: &PositionClosed) -> Result<(), NotifyError>;
    async fn position_reduced(&self, event: &PositionReduced) -> Result<(), NotifyError>;
}

/// HTTP sink posting JSON events to the tracker service.
pub struct HttpPositionSink {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpPositionSink {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(SINK_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            bearer_token,
        })
    }

    fn endpoint(&self, slot_id: u32, action: &str) -> String {
        format!(
            "{}/positions/{slot_id}/{action}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn post<T: Serialize + ?Sized>(&self, url: String, body: &T) -> Result<(), NotifyError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl PositionSink for HttpPositionSink {
    async fn position_closed(&self, event: &PositionClosed) -> Result<(), NotifyError> {
        self.post(self.endpoint(event.slot_id, "close"), event).await
    }

    async fn position_reduced(&self, event: &PositionReduced) -> Result<(), NotifyError> {
        self.post(self.endpoint(event.slot_id, "reduce"), event).await
    }
}

/// Sink that drops every event. Used when no tracker is configured.
pub struct NoopSink;

#[async_trait]
impl PositionSink for NoopSink {
    async fn position_closed(&self, _event: &PositionClosed) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn position_reduced(&self, _event: &PositionReduced) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Deliver a close event without blocking the caller.
pub fn notify_closed(sink: Arc<dyn PositionSink>, event: PositionClosed) {
    tokio::spawn(async move {
        match sink.position_closed(&event).await {
            Ok(()) => {
                debug!(slot = event.slot_id, reason = %event.reason, "Position close reported");
                Metrics::notification("close", true);
            }
            Err(e) => {
                warn!(slot = event.slot_id, error = %e, "Position close notification failed");
                Metrics::notification("close", false);
            }
        }
    });
}

/// Deliver a partial-exit event without blocking the caller.
pub fn notify_reduced(sink: Arc<dyn PositionSink>, event: PositionReduced) {
    tokio::spawn(async move {
        match sink.position_reduced(&event).await {
            Ok(()) => {
                debug!(slot = event.slot_id, update = %event.update_type, "Position update reported");
                Metrics::notification("reduce", true);
            }
            Err(e) => {
                warn!(slot = event.slot_id, error = %e, "Position update notification failed");
                Metrics::notification("reduce", false);
            }
        }
    });
}
