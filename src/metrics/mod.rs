//! Metrics for the group coordination engine
//!
//! Values are recorded through the `metrics` facade; the embedding
//! application installs whatever recorder/exporter it wants.
//!
//! When the `metrics` feature is disabled, all functions become no-ops,
//! keeping the same API surface.

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static DESCRIBED: Once = Once::new();

/// Register metric descriptions with the installed recorder
#[cfg(feature = "metrics")]
pub fn describe_metrics() {
    DESCRIBED.call_once(|| {
        describe_gauge!(
            "streamline_client_event_queue_size",
            "Events waiting in the application or background queue"
        );
        describe_counter!(
            "streamline_client_heartbeats_total",
            "Group heartbeats sent to the coordinator"
        );
        describe_counter!(
            "streamline_client_heartbeat_errors_total",
            "Heartbeat responses carrying an error code"
        );
        describe_counter!(
            "streamline_client_coordinator_discoveries_total",
            "Successful FindCoordinator lookups"
        );
        describe_counter!(
            "streamline_client_rebalance_callbacks_total",
            "Rebalance callbacks completed, by kind and outcome"
        );
        describe_counter!(
            "streamline_client_acknowledgements_sent_total",
            "Share acknowledgements sent to partition leaders"
        );
        describe_counter!(
            "streamline_client_acknowledgements_failed_total",
            "Share acknowledgements completed with an error"
        );
        describe_counter!(
            "streamline_client_member_transitions_total",
            "Membership state transitions, by target state"
        );
    });
}

/// Update the size gauge of an event queue
#[cfg(feature = "metrics")]
pub fn update_queue_size(queue: &'static str, size: usize) {
    gauge!("streamline_client_event_queue_size", "queue" => queue).set(size as f64);
}

/// Record a heartbeat request sent
#[cfg(feature = "metrics")]
pub fn record_heartbeat_sent(group_type: &'static str) {
    counter!("streamline_client_heartbeats_total", "group_type" => group_type).increment(1);
}

/// Record a heartbeat error response
#[cfg(feature = "metrics")]
pub fn record_heartbeat_error(group_type: &'static str, code: i16) {
    counter!(
        "streamline_client_heartbeat_errors_total",
        "group_type" => group_type,
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a coordinator discovery
#[cfg(feature = "metrics")]
pub fn record_coordinator_discovered() {
    counter!("streamline_client_coordinator_discoveries_total").increment(1);
}

/// Record a rebalance callback completion
#[cfg(feature = "metrics")]
pub fn record_rebalance_callback(kind: &'static str, success: bool) {
    counter!(
        "streamline_client_rebalance_callbacks_total",
        "kind" => kind,
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record acknowledgements sent in a request
#[cfg(feature = "metrics")]
pub fn record_acknowledgements_sent(count: usize) {
    counter!("streamline_client_acknowledgements_sent_total").increment(count as u64);
}

/// Record acknowledgements completed with an error
#[cfg(feature = "metrics")]
pub fn record_acknowledgements_failed(count: usize) {
    counter!("streamline_client_acknowledgements_failed_total").increment(count as u64);
}

/// Record a membership state transition
#[cfg(feature = "metrics")]
pub fn record_member_transition(state: &'static str) {
    counter!("streamline_client_member_transitions_total", "state" => state).increment(1);
}

// ============================================================================
// No-op implementations when metrics feature is disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn describe_metrics() {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn update_queue_size(_queue: &'static str, _size: usize) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_heartbeat_sent(_group_type: &'static str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_heartbeat_error(_group_type: &'static str, _code: i16) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_coordinator_discovered() {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_rebalance_callback(_kind: &'static str, _success: bool) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_acknowledgements_sent(_count: usize) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_acknowledgements_failed(_count: usize) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_member_transition(_state: &'static str) {}
