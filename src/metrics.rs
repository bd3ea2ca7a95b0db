//! Prometheus metrics for the orchestration fabric.
//!
//! Counters, gauges, and histograms covering event publication, connection
//! lifecycle, scheduling, and alerting. Exposed through the telemetry
//! service's `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram,
    TextEncoder,
};

lazy_static! {
    /// Counter for events successfully published on all paths
    pub static ref EVENTS_PUBLISHED: Counter = register_counter!(
        "storyweave_events_published_total",
        "Total number of events published"
    ).expect("Can't create events_published metric");

    /// Counter for events that failed on at least one publish path
    pub static ref EVENTS_FAILED: Counter = register_counter!(
        "storyweave_events_failed_total",
        "Total number of event publish failures"
    ).expect("Can't create events_failed metric");

    /// Gauge for currently open WebSocket connections
    pub static ref ACTIVE_CONNECTIONS: Gauge = register_gauge!(
        "storyweave_ws_connections_active",
        "Number of currently active WebSocket connections"
    ).expect("Can't create ws_connections_active metric");

    /// Counter for refused connection upgrades (capacity or disabled)
    pub static ref CONNECTIONS_REFUSED: Counter = register_counter!(
        "storyweave_ws_connections_refused_total",
        "Total number of refused WebSocket connections"
    ).expect("Can't create ws_connections_refused metric");

    /// Counter for evicted connections (heartbeat or idle timeout)
    pub static ref CONNECTIONS_EVICTED: Counter = register_counter!(
        "storyweave_ws_connections_evicted_total",
        "Total number of evicted WebSocket connections"
    ).expect("Can't create ws_connections_evicted metric");

    /// Counter for outbound frames dropped by full per-connection queues
    pub static ref FRAMES_DROPPED: Counter = register_counter!(
        "storyweave_ws_frames_dropped_total",
        "Total number of outbound frames dropped due to backpressure"
    ).expect("Can't create ws_frames_dropped metric");

    /// Counter for frames delivered to connection queues by fan-out
    pub static ref FRAMES_ENQUEUED: Counter = register_counter!(
        "storyweave_ws_frames_enqueued_total",
        "Total number of frames enqueued for delivery"
    ).expect("Can't create ws_frames_enqueued metric");

    /// Gauge for active tracked operations
    pub static ref OPERATIONS_ACTIVE: Gauge = register_gauge!(
        "storyweave_operations_active",
        "Number of operations currently tracked for progressive feedback"
    ).expect("Can't create operations_active metric");

    /// Gauge for active tracked workflows
    pub static ref WORKFLOWS_ACTIVE: Gauge = register_gauge!(
        "storyweave_workflows_active",
        "Number of workflows currently tracked"
    ).expect("Can't create workflows_active metric");

    /// Counter for scheduling decisions made
    pub static ref SCHEDULING_DECISIONS: Counter = register_counter!(
        "storyweave_scheduling_decisions_total",
        "Total number of successful scheduling decisions"
    ).expect("Can't create scheduling_decisions metric");

    /// Counter for alerts fired
    pub static ref ALERTS_FIRED: Counter = register_counter!(
        "storyweave_alerts_fired_total",
        "Total number of alerts fired"
    ).expect("Can't create alerts_fired metric");

    /// Counter for alerts resolved
    pub static ref ALERTS_RESOLVED: Counter = register_counter!(
        "storyweave_alerts_resolved_total",
        "Total number of alerts resolved"
    ).expect("Can't create alerts_resolved metric");

    /// Histogram for recorded operation durations
    pub static ref OPERATION_DURATION_SECONDS: Histogram = register_histogram!(
        "storyweave_operation_duration_seconds",
        "Duration of recorded operations in seconds"
    ).expect("Can't create operation_duration metric");
}

/// Encode the default registry as Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!("failed to encode metrics: {}", err);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        EVENTS_PUBLISHED.inc();
        let text = gather();
        assert!(text.contains("storyweave_events_published_total"));
    }
}
