//! Bridges between the performance stack and the event bus.
//!
//! The bridge loop periodically publishes `SystemMetrics` events built from
//! live component state, and the publisher-backed notifier turns alert
//! transitions into `Error` events so they reach the WebSocket fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::performance::alerts::{Alert, AlertNotifier, AlertState};
use crate::performance::monitor::{LatencyMonitor, OperationClass};
use crate::realtime::manager::ConnectionManager;
use crate::realtime::publisher::EventPublisher;
use crate::realtime::workflow::WorkflowTracker;

/// Periodic system-metrics publisher.
pub struct PerformanceEventBridge {
    publisher: Arc<EventPublisher>,
    connections: Arc<ConnectionManager>,
    workflows: Arc<WorkflowTracker>,
    monitor: Arc<LatencyMonitor>,
    interval: Duration,
}

impl PerformanceEventBridge {
    pub fn new(
        publisher: Arc<EventPublisher>,
        connections: Arc<ConnectionManager>,
        workflows: Arc<WorkflowTracker>,
        monitor: Arc<LatencyMonitor>,
        interval_secs: f64,
    ) -> Self {
        Self {
            publisher,
            connections,
            workflows,
            monitor,
            interval: Duration::from_secs_f64(interval_secs.max(1.0)),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.broadcast_system_metrics().await;
                }
            }
        }
        debug!("performance event bridge exited");
    }

    async fn broadcast_system_metrics(&self) {
        let workflow_stats = self.monitor.statistics(OperationClass::WorkflowExecution);
        let (response_time_avg, error_rate) = match workflow_stats {
            Some(stats) => (
                Some(stats.average_duration),
                Some((1.0 - stats.success_rate) * 100.0),
            ),
            None => (None, None),
        };

        self.publisher
            .publish_system_metrics(
                Some(self.connections.active_count().await as u64),
                Some(self.workflows.active_count().await as u64),
                Some(self.publisher.buffer_len() as u64),
                response_time_avg,
                error_rate,
            )
            .await;
    }
}

/// Notifier that feeds alert transitions back onto the event bus.
pub struct PublisherAlertNotifier {
    publisher: Arc<EventPublisher>,
}

impl PublisherAlertNotifier {
    pub fn new(publisher: Arc<EventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl AlertNotifier for PublisherAlertNotifier {
    async fn notify(&self, alert: &Alert) {
        let (code, severity) = match alert.status {
            AlertState::Active => ("ALERT_FIRED", alert.severity.as_str()),
            AlertState::Resolved => ("ALERT_RESOLVED", "info"),
            AlertState::Acknowledged => ("ALERT_ACKNOWLEDGED", "info"),
        };
        let details = HashMap::from([
            ("rule_name".to_string(), json!(alert.rule_name)),
            ("value".to_string(), json!(alert.value)),
            ("threshold".to_string(), json!(alert.threshold)),
            ("labels".to_string(), json!(alert.labels)),
        ]);
        self.publisher
            .publish_error(code, &alert.message, severity, Some("alert_manager".to_string()), details)
            .await;
    }
}
