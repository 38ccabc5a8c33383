//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names shared by the registry, the batcher, and the session loop.

/// Subscribers registered total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Subscribers deregistered total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Registered subscribers (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Subscribers evicted after a failed send (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Batches produced by a flush (counter).
pub const BATCHES_FLUSHED_TOTAL: &str = "batches_flushed_total";
/// Patches dropped by same-path coalescing (counter).
pub const PATCHES_COALESCED_TOTAL: &str = "patches_coalesced_total";
/// Messages handed to the batcher (counter).
pub const MESSAGES_ENQUEUED_TOTAL: &str = "messages_enqueued_total";
