//! Metrics definitions for the conference server.
//!
//! All metrics follow Prometheus naming conventions:
//! - `conf_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 4 values (registry, room, manager, connection)
//! - `route`: 6 values (see `relay::Route`)
//! - `architecture`: 3 values (mesh, sfu, mcu)
//! - `event`: 7 negotiation events
//! - `message_type`: bounded by `MessageType::metric_label` (~14 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Negotiation event labels.
pub mod negotiation_event {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const GLARE_IGNORED: &str = "glare_ignored";
    pub const GLARE_ROLLBACK: &str = "glare_rollback";
    pub const JAMMED_RESTART: &str = "jammed_restart";
    pub const ICE_RESTART: &str = "ice_restart";
    pub const FAILURE: &str = "failure";
}

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Relay latency - in-process hop, should stay well under 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("conf_message".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Participant Metrics (Gauges)
// ============================================================================

/// Set the number of open rooms.
///
/// Metric: `conf_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("conf_rooms_active").set(count as f64);
}

/// Set the number of participants that are members of a room.
///
/// Metric: `conf_participants_active`
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("conf_participants_active").set(count as f64);
}

/// A negotiated peer link was created.
///
/// Metric: `conf_connections_active`
pub fn connection_opened() {
    gauge!("conf_connections_active").increment(1.0);
}

/// A negotiated peer link closed.
pub fn connection_closed() {
    gauge!("conf_connections_active").decrement(1.0);
}

// ============================================================================
// Relay & Architecture Metrics (Counters)
// ============================================================================

/// Record one relayed message.
///
/// Metric: `conf_relay_messages_total`
/// Labels: `route`
pub fn record_relay_message(route: &'static str) {
    counter!("conf_relay_messages_total", "route" => route).increment(1);
}

/// Record an architecture switch that actually happened.
///
/// Metric: `conf_architecture_switches_total`
/// Labels: `architecture` (the new one)
pub fn record_architecture_switch(architecture: &'static str) {
    counter!("conf_architecture_switches_total", "architecture" => architecture).increment(1);
}

/// Record a negotiation step or fault on a peer link.
///
/// Metric: `conf_negotiation_events_total`
/// Labels: `event` (see [`negotiation_event`])
pub fn record_negotiation_event(event: &'static str) {
    counter!("conf_negotiation_events_total", "event" => event).increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record how long the room took to route one inbound message.
///
/// Metric: `conf_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("conf_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `conf_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("conf_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Record an actor task that ended by panicking.
///
/// Metric: `conf_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("conf_actor_panics_total", "actor_type" => actor_type).increment(1);
}
