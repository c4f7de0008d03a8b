//! Metric definitions for the call session coordinator.
//!
//! Naming follows Prometheus conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `direction`: 2 values (outbound, inbound)
//! - `event`: 3 values (stream, close, error)
//! - `operation`: bounded by the collaborator calls made (~8 values)
//!
//! Peer and meeting identities are never used as labels.

use crate::registry::DialDirection;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// the exposition text.
///
/// Leave duration buckets cover the per-step timeout (5s by default) for the
/// two steps that are bounded by it.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("call_leave".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set leave duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Transport
// ============================================================================

/// Record a transport handle allocation.
///
/// Metric: `call_transport_allocations_total`
/// Labels: none
pub fn record_transport_allocation() {
    counter!("call_transport_allocations_total").increment(1);
}

/// Record an armed reconnect timer.
///
/// Metric: `call_reconnects_scheduled_total`
/// Labels: none
pub fn record_reconnect_scheduled() {
    counter!("call_reconnects_scheduled_total").increment(1);
}

/// Record an identity rejected as already in use.
///
/// Metric: `call_identity_collisions_total`
/// Labels: none
pub fn record_identity_collision() {
    counter!("call_identity_collisions_total").increment(1);
}

// ============================================================================
// Peer connections
// ============================================================================

/// Record a peer connection placed or answered.
///
/// Metric: `call_dials_total`
/// Labels: `direction` (outbound, inbound)
pub fn record_dial(direction: DialDirection) {
    counter!("call_dials_total", "direction" => direction.as_str()).increment(1);
}

/// Record a lifecycle event on a peer connection.
///
/// Metric: `call_peer_connection_events_total`
/// Labels: `event` (stream, close, error)
pub fn record_connection_event(event: &'static str) {
    counter!("call_peer_connection_events_total", "event" => event).increment(1);
}

/// Set the number of remote peers tracked by the registry.
///
/// Metric: `call_remote_peers`
/// Labels: none
pub fn set_remote_peers(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_remote_peers").set(count as f64);
}

// ============================================================================
// Collaborators
// ============================================================================

/// Record a failed best-effort collaborator call.
///
/// Metric: `call_collaborator_failures_total`
/// Labels: `operation`
///
/// Operations: `presence_publish`, `presence_refresh`, `presence_remove`,
/// `signal_announce`, `signal_clear`, `dial`, `answer`, `transport_destroy`.
pub fn record_collaborator_failure(operation: &'static str) {
    counter!("call_collaborator_failures_total", "operation" => operation).increment(1);
}

// ============================================================================
// Leave
// ============================================================================

/// Record how long the leave routine took.
///
/// Metric: `call_leave_duration_seconds`
/// Labels: none
pub fn record_leave_duration(duration: Duration) {
    histogram!("call_leave_duration_seconds").record(duration.as_secs_f64());
}
