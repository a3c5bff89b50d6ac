//! HTTP server implementation using axum.
//!
//! Three routes: the TradingView-style webhook, a health snapshot and
//! the Prometheus scrape endpoint. Trigger semantics live in
//! `ripcord-trigger`; this layer only maps them onto HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ripcord_telemetry::Metrics;
use ripcord_trigger::{TriggerError, TriggerPayload, TriggerProcessor};
use ripcord_ws::{ConnectionSupervisor, SupervisorStatus};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    processor: Arc<TriggerProcessor>,
    supervisor: Arc<ConnectionSupervisor>,
    started_at: Instant,
}

impl AppState {
    pub fn new(processor: Arc<TriggerProcessor>, supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            processor,
            supervisor,
            started_at: Instant::now(),
        }
    }
}

/// Create the axum router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/trigger", post(post_trigger))
        .route("/healthz", get(get_health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            message: message.into(),
        }),
    )
        .into_response()
}

/// Receive one exit trigger.
///
/// Auth and shape problems map to 401/400; everything past validation
/// is a 200 whose summary reports per-user outcomes.
async fn post_trigger(
    State(state): State<AppState>,
    payload: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection, "Webhook body rejected");
            Metrics::trigger_rejected("validation");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    // Detached task: a sender that times out and drops the connection
    // must not cancel the fan-out mid-claim.
    let processor = state.processor.clone();
    let result = match tokio::spawn(async move { processor.process(payload).await }).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Trigger task aborted");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "trigger task aborted");
        }
    };

    match result {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e @ TriggerError::Auth) => {
            warn!("Webhook auth rejected");
            Metrics::trigger_rejected("auth");
            error_response(StatusCode::UNAUTHORIZED, e.to_string())
        }
        Err(e @ TriggerError::Validation(_)) => {
            warn!(error = %e, "Webhook payload rejected");
            Metrics::trigger_rejected("validation");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    uptime_secs: u64,
    connections: SupervisorStatus,
}

/// Liveness plus a stream snapshot, cheap enough for tight polling.
async fn get_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.supervisor.status(),
    })
}

/// Prometheus scrape endpoint.
async fn get_metrics() -> Response {
    match Metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Run the HTTP server until the token cancels.
pub async fn run_server(
    state: AppState,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting webhook server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Webhook server stopped");
    Ok(())
}
