//! Centralized event publisher.
//!
//! Every event leaves through three paths: a bounded in-memory ring buffer
//! (observability and recent-event queries), the broker channels (general,
//! per-type, per-user), and the registered in-process sinks (the connection
//! manager registers itself here on boot). Broker and sink dispatch run
//! concurrently; a failure on one path never blocks the others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::agents::AgentKind;
use crate::errors::Result;
use crate::events::{now_ts, AgentState, Event, EventPayload, WorkflowStatus};
use crate::metrics;
use crate::platform::config::EventSettings;
use crate::realtime::gateway::BrokerGateway;

const SOURCE: &str = "event_publisher";

/// In-process delivery capability. The connection manager implements this;
/// registration replaces any back-pointer between publisher and manager.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<usize>;
}

/// Publisher statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PublisherStats {
    pub enabled: bool,
    pub events_published: u64,
    pub events_failed: u64,
    pub last_publish_time: f64,
    pub buffer_len: usize,
    pub sinks: usize,
}

pub struct EventPublisher {
    settings: EventSettings,
    enabled: AtomicBool,
    gateway: Option<Arc<BrokerGateway>>,
    buffer: Mutex<VecDeque<Event>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    events_published: AtomicU64,
    events_failed: AtomicU64,
    last_publish_bits: AtomicU64,
}

impl EventPublisher {
    pub fn new(settings: EventSettings, enabled: bool, gateway: Option<Arc<BrokerGateway>>) -> Self {
        Self {
            settings,
            enabled: AtomicBool::new(enabled),
            gateway,
            buffer: Mutex::new(VecDeque::new()),
            sinks: RwLock::new(Vec::new()),
            events_published: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            last_publish_bits: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write();
        sinks.push(sink);
        debug!(total = sinks.len(), "registered event sink");
    }

    pub fn deregister_sink(&self, sink: &Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write();
        sinks.retain(|existing| !Arc::ptr_eq(existing, sink));
        debug!(total = sinks.len(), "deregistered event sink");
    }

    pub fn channel_prefix(&self) -> &str {
        &self.settings.redis_channel_prefix
    }

    /// The broker channels a given event fans out to.
    fn channels_for(&self, event: &Event) -> Vec<String> {
        let prefix = &self.settings.redis_channel_prefix;
        let mut channels = vec![
            format!("{prefix}:all"),
            format!("{prefix}:{}", event.event_type().as_str()),
        ];
        if let Some(user_id) = event.user_id() {
            channels.push(format!("{prefix}:user:{user_id}"));
        }
        channels
    }

    /// Publish a fully-formed event through all three paths. Returns overall
    /// success (AND across paths); callers do not retry.
    pub async fn publish_event(&self, event: Event) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("failed to encode event: {}", err);
                self.record_failure();
                return false;
            }
        };

        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(event.clone());
            while buffer.len() > self.settings.buffer_size {
                buffer.pop_front();
            }
        }

        let broker_path = async {
            let Some(gateway) = &self.gateway else {
                return true;
            };
            let mut ok = true;
            for channel in self.channels_for(&event) {
                if let Err(err) = gateway.publish(&channel, &encoded).await {
                    debug!(channel, "broker publish failed: {}", err);
                    ok = false;
                }
            }
            ok
        };

        let sink_path = async {
            let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().clone();
            let mut ok = true;
            for sink in sinks {
                if let Err(err) = sink.deliver(&event).await {
                    error!("event sink delivery failed: {}", err);
                    ok = false;
                }
            }
            ok
        };

        let (broker_ok, sink_ok) = tokio::join!(broker_path, sink_path);
        let success = broker_ok && sink_ok;

        if success {
            self.events_published.fetch_add(1, Ordering::Relaxed);
            metrics::EVENTS_PUBLISHED.inc();
        } else {
            self.record_failure();
        }
        self.last_publish_bits
            .store(now_ts().to_bits(), Ordering::Relaxed);

        success
    }

    fn record_failure(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
        metrics::EVENTS_FAILED.inc();
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn publish_agent_status(
        &self,
        agent_id: &str,
        kind: AgentKind,
        status: AgentState,
        instance: Option<String>,
        previous_status: Option<AgentState>,
        heartbeat_age: Option<f64>,
        metadata: HashMap<String, Value>,
    ) -> bool {
        if !self.is_enabled() || !self.settings.broadcast_agent_status {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::AgentStatus {
                agent_id: agent_id.to_string(),
                agent_type: kind.as_str().to_string(),
                instance,
                status,
                previous_status,
                heartbeat_age,
                metadata,
            },
        ))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn publish_workflow_progress(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        status: WorkflowStatus,
        progress_percentage: f64,
        current_step: Option<String>,
        total_steps: Option<u32>,
        completed_steps: Option<u32>,
        estimated_completion: Option<f64>,
        user_id: Option<String>,
    ) -> bool {
        if !self.is_enabled() || !self.settings.broadcast_workflow_progress {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::WorkflowProgress {
                workflow_id: workflow_id.to_string(),
                workflow_type: workflow_type.to_string(),
                status,
                progress_percentage,
                current_step,
                total_steps,
                completed_steps,
                estimated_completion,
                user_id,
            },
        ))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn publish_progressive_feedback(
        &self,
        operation_id: &str,
        operation_type: &str,
        stage: &str,
        message: &str,
        progress_percentage: f64,
        intermediate_result: Option<HashMap<String, Value>>,
        estimated_remaining: Option<f64>,
        user_id: Option<String>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::ProgressiveFeedback {
                operation_id: operation_id.to_string(),
                operation_type: operation_type.to_string(),
                stage: stage.to_string(),
                message: message.to_string(),
                progress_percentage,
                intermediate_result,
                estimated_remaining,
                user_id,
            },
        ))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn publish_system_metrics(
        &self,
        active_connections: Option<u64>,
        active_workflows: Option<u64>,
        message_queue_size: Option<u64>,
        response_time_avg: Option<f64>,
        error_rate: Option<f64>,
    ) -> bool {
        if !self.is_enabled() || !self.settings.broadcast_system_metrics {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::SystemMetrics {
                cpu_usage: None,
                memory_usage: None,
                memory_usage_mb: None,
                active_connections,
                active_workflows,
                message_queue_size,
                response_time_avg,
                error_rate,
            },
        ))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn publish_optimization(
        &self,
        optimization_type: &str,
        parameter_name: &str,
        old_value: Value,
        new_value: Value,
        improvement_metric: Option<String>,
        improvement_value: Option<f64>,
        confidence_score: Option<f64>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::Optimization {
                optimization_type: optimization_type.to_string(),
                parameter_name: parameter_name.to_string(),
                old_value,
                new_value,
                improvement_metric,
                improvement_value,
                confidence_score,
            },
        ))
        .await
    }

    pub async fn publish_error(
        &self,
        error_code: &str,
        error_message: &str,
        severity: &str,
        component: Option<String>,
        error_details: HashMap<String, Value>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.publish_event(Event::new(
            SOURCE,
            EventPayload::Error {
                error_code: error_code.to_string(),
                error_message: error_message.to_string(),
                error_details,
                severity: severity.to_string(),
                component,
            },
        ))
        .await
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        let buffer = self.buffer.lock();
        buffer.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            enabled: self.is_enabled(),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            last_publish_time: f64::from_bits(self.last_publish_bits.load(Ordering::Relaxed)),
            buffer_len: self.buffer_len(),
            sinks: self.sinks.read().len(),
        }
    }

    /// Disable publication and drop retained state.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.sinks.write().clear();
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn deliver(&self, _event: &Event) -> Result<usize> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn publisher(buffer_size: usize) -> EventPublisher {
        let settings = EventSettings {
            buffer_size,
            ..EventSettings::default()
        };
        EventPublisher::new(settings, true, None)
    }

    #[tokio::test]
    async fn test_publish_reaches_registered_sinks() {
        let publisher = publisher(10);
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        publisher.register_sink(sink.clone());

        let ok = publisher
            .publish_progressive_feedback("op-1", "story_generation", "executing", "half", 50.0, None, None, None)
            .await;
        assert!(ok);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.stats().events_published, 1);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let publisher = publisher(3);
        for i in 0..5 {
            publisher
                .publish_event(Event::heartbeat("test", Some(format!("c{i}")), None, None))
                .await;
        }
        assert_eq!(publisher.buffer_len(), 3);
        let recent = publisher.recent_events(10);
        // Oldest two were evicted.
        match &recent[0].payload {
            EventPayload::Heartbeat { connection_id, .. } => {
                assert_eq!(connection_id.as_deref(), Some("c2"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_everything() {
        let publisher = EventPublisher::new(EventSettings::default(), false, None);
        let ok = publisher
            .publish_event(Event::heartbeat("test", None, None, None))
            .await;
        assert!(!ok);
        assert_eq!(publisher.buffer_len(), 0);
    }

    #[tokio::test]
    async fn test_per_type_gates() {
        let settings = EventSettings {
            broadcast_agent_status: false,
            ..EventSettings::default()
        };
        let publisher = EventPublisher::new(settings, true, None);
        let ok = publisher
            .publish_agent_status(
                "ipa-0",
                AgentKind::InputProcessor,
                AgentState::Online,
                None,
                None,
                None,
                HashMap::new(),
            )
            .await;
        assert!(!ok);
        assert_eq!(publisher.buffer_len(), 0);
    }

    #[tokio::test]
    async fn test_channels_include_user_channel_when_scoped() {
        let publisher = publisher(10);
        let event = Event::new(
            "test",
            EventPayload::WorkflowProgress {
                workflow_id: "wf".into(),
                workflow_type: "story".into(),
                status: WorkflowStatus::Running,
                progress_percentage: 10.0,
                current_step: None,
                total_steps: None,
                completed_steps: None,
                estimated_completion: None,
                user_id: Some("user-7".into()),
            },
        );
        let channels = publisher.channels_for(&event);
        assert_eq!(
            channels,
            vec![
                "sw:events:all".to_string(),
                "sw:events:workflow_progress".to_string(),
                "sw:events:user:user-7".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_deregistered_sink_no_longer_receives() {
        let publisher = publisher(10);
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn EventSink> = sink.clone();
        publisher.register_sink(as_dyn.clone());
        publisher.deregister_sink(&as_dyn);

        publisher
            .publish_event(Event::heartbeat("test", None, None, None))
            .await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }
}
