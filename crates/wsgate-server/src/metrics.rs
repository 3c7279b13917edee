//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if another recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// Accepted TCP streams (counter).
pub const WS_ACCEPTED_TOTAL: &str = "ws_accepted_total";
/// Live transport sessions, upgraded or not (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Registered connections as seen by the registry (gauge).
pub const WS_ESTABLISHED: &str = "ws_established";
/// Handshakes by outcome (counter, labels: outcome).
pub const WS_HANDSHAKES_TOTAL: &str = "ws_handshakes_total";
/// Closed upgraded connections (counter, labels: reason).
pub const WS_CLOSED_TOTAL: &str = "ws_closed_total";
/// Connections evicted for inactivity (counter).
pub const WS_IDLE_EVICTIONS_TOTAL: &str = "ws_idle_evictions_total";
/// Data frames dropped because the worker pool refused them (counter).
pub const WS_DATA_DROPPED_TOTAL: &str = "ws_data_dropped_total";
/// Outbound writes dropped on a full queue (counter).
pub const WS_WRITES_DROPPED_TOTAL: &str = "ws_writes_dropped_total";
/// Registry messages rejected (counter, labels: operation).
pub const REGISTRY_CONFLICTS_TOTAL: &str = "registry_conflicts_total";
/// Pool tasks that panicked (counter).
pub const POOL_TASK_PANICS_TOTAL: &str = "pool_task_panics_total";
/// Due timers put back because every job slot was busy (counter).
pub const TIMER_JOBS_DEFERRED_TOTAL: &str = "timer_jobs_deferred_total";
