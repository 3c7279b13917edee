//! `/health` and `/metrics` endpoints, plus the periodic readout log.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::WS_ESTABLISHED;
use crate::registry::RegistryHandle;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live transport sessions.
    pub connections: usize,
    /// Connections registered by the application.
    pub established: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, established: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        established,
    }
}

/// Counters the health endpoints read.
#[derive(Clone)]
pub struct HealthState {
    /// When the server started.
    pub start_time: Instant,
    /// Live transport sessions.
    pub live: Arc<AtomicUsize>,
    /// Registry, for the established count.
    pub registry: RegistryHandle,
    /// Prometheus renderer, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Router serving `/health` and `/metrics`.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(health_check(
        state.start_time,
        state.live.load(Ordering::Relaxed),
        state.registry.established_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<HealthState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Log and publish the connection counts every `interval`.
pub fn spawn_readout(
    interval: Duration,
    live: Arc<AtomicUsize>,
    registry: RegistryHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let connections = live.load(Ordering::Relaxed);
                    let established = registry.established_count();
                    #[allow(clippy::cast_precision_loss)]
                    let established_value = established as f64;
                    gauge!(WS_ESTABLISHED).set(established_value);
                    info!(connections, established, "readout");
                }
            }
        }
    })
}
