//! Prometheus metrics for the ripcord exit-execution service.
//!
//! Covers the trigger pipeline (received, duplicates, per-user
//! outcomes), exit order placement, circuit breaker state, and the
//! websocket supervisor.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration
//! fails, it indicates a fatal configuration error (e.g., duplicate
//! metric names) that should cause an immediate crash at startup rather
//! than silent failure. These panics only occur during static
//! initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Total exit triggers accepted for fan-out.
pub static TRIGGERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_triggers_total",
        "Total exit triggers accepted for fan-out",
        &["symbol", "kind"]
    )
    .unwrap()
});

/// Triggers rejected by the deduplicator.
/// Labels: reason (cooldown/in_flight)
pub static TRIGGER_DUPLICATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_trigger_duplicates_total",
        "Triggers rejected by the dedup gate",
        &["reason"]
    )
    .unwrap()
});

/// Triggers rejected at the webhook before any processing.
/// Labels: reason (auth/validation)
pub static TRIGGER_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_trigger_rejected_total",
        "Webhook requests rejected before processing",
        &["reason"]
    )
    .unwrap()
});

/// Per-user fan-out outcomes.
/// Labels: outcome (sold/skipped/failed), reason (skip or failure reason,
/// empty for sold)
pub static USER_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_user_outcomes_total",
        "Per-user trigger fan-out outcomes",
        &["outcome", "reason"]
    )
    .unwrap()
});

/// Exit orders placed on a venue.
pub static EXIT_ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_exit_orders_total",
        "Exit orders accepted by a venue",
        &["exchange", "order_type"]
    )
    .unwrap()
});

/// Wall time of one trigger fan-out, webhook receipt to aggregation.
pub static TRIGGER_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ripcord_trigger_duration_ms",
        "Trigger fan-out duration in milliseconds",
        &["kind"],
        vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]
    )
    .unwrap()
});

/// Circuit breakers currently open.
pub static BREAKERS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ripcord_breakers_open",
        "Circuit breakers currently in the open state"
    )
    .unwrap()
});

/// Authenticated private order streams.
pub static WS_PRIVATE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ripcord_ws_private_connections",
        "Private order streams currently authenticated"
    )
    .unwrap()
});

/// Current reconnect attempt counter per user (0 while healthy).
pub static WS_RECONNECT_ATTEMPTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "ripcord_ws_reconnect_attempts",
        "Reconnect attempt counter per user, 0 while healthy",
        &["user"]
    )
    .unwrap()
});

/// Position notifications sent downstream.
/// Labels: kind (close/reduce), result (ok/error)
pub static NOTIFICATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ripcord_notifications_total",
        "Position notifications sent to the downstream sink",
        &["kind", "result"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a trigger accepted for fan-out.
    pub fn trigger_received(symbol: &str, kind: &str) {
        TRIGGERS_TOTAL.with_label_values(&[symbol, kind]).inc();
    }

    /// Record a trigger rejected by the dedup gate.
    pub fn trigger_duplicate(reason: &str) {
        TRIGGER_DUPLICATES_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a webhook request rejected before processing.
    pub fn trigger_rejected(reason: &str) {
        TRIGGER_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record one user's fan-out outcome.
    pub fn user_outcome(outcome: &str, reason: &str) {
        USER_OUTCOMES_TOTAL
            .with_label_values(&[outcome, reason])
            .inc();
    }

    /// Record an exit order accepted by a venue.
    pub fn exit_order_placed(exchange: &str, order_type: &str) {
        EXIT_ORDERS_TOTAL
            .with_label_values(&[exchange, order_type])
            .inc();
    }

    /// Record trigger fan-out duration.
    pub fn trigger_duration(kind: &str, duration_ms: f64) {
        TRIGGER_DURATION_MS
            .with_label_values(&[kind])
            .observe(duration_ms);
    }

    /// Update the open breaker count.
    pub fn breakers_open(count: i64) {
        BREAKERS_OPEN.set(count);
    }

    /// Update the authenticated private stream count.
    pub fn ws_private_connections(count: i64) {
        WS_PRIVATE_CONNECTIONS.set(count);
    }

    /// Update a user's reconnect attempt counter.
    pub fn ws_reconnect_attempts(user: &str, attempts: f64) {
        WS_RECONNECT_ATTEMPTS
            .with_label_values(&[user])
            .set(attempts);
    }

    /// Record a position notification result.
    pub fn notification(kind: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        NOTIFICATIONS_TOTAL
            .with_label_values(&[kind, result])
            .inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
