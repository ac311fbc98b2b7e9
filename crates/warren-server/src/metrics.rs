//! Prometheus metrics for the management server

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system
pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => {
            METRICS_HANDLE.set(handle).ok();
            tracing::info!("Metrics system initialized");
        }
        Err(e) => {
            tracing::warn!("failed to install metrics recorder: {e}");
        }
    }
}

/// Rendered Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|h| h.render())
}

/// A peer reported changed system metadata during login or sync.
pub fn count_peer_meta_update() {
    counter!("warren_peer_meta_updates_total").increment(1);
}

pub fn record_posture_checks_duration(duration: Duration) {
    histogram!("warren_calc_posture_checks_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_network_map_duration(duration: Duration) {
    histogram!("warren_calc_network_map_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_sync_response_duration(duration: Duration) {
    histogram!("warren_to_sync_response_duration_seconds").record(duration.as_secs_f64());
}

/// Wall-clock time of one whole account broadcast pass.
pub fn record_update_account_peers_duration(duration: Duration) {
    histogram!("warren_update_account_peers_duration_seconds").record(duration.as_secs_f64());
}

pub fn count_broadcast_dropped_update() {
    counter!("warren_broadcast_dropped_updates_total").increment(1);
}
