//! Event model for real-time communication.
//!
//! Every observation the fabric makes (agent status transitions, workflow
//! progress, progressive feedback, metrics, alerts) travels as an [`Event`]:
//! a common envelope (id, timestamp, source) wrapping a tagged payload union.
//! The wire format is flat, self-describing JSON with an `event_type`
//! discriminator, stable across broker channels and WebSocket frames.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wall clock as fractional epoch seconds, the timestamp unit used on the wire.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    WorkflowProgress,
    SystemMetrics,
    ProgressiveFeedback,
    Optimization,
    ConnectionStatus,
    Error,
    Heartbeat,
}

impl EventType {
    /// Channel suffix / wire tag for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStatus => "agent_status",
            EventType::WorkflowProgress => "workflow_progress",
            EventType::SystemMetrics => "system_metrics",
            EventType::ProgressiveFeedback => "progressive_feedback",
            EventType::Optimization => "optimization",
            EventType::ConnectionStatus => "connection_status",
            EventType::Error => "error",
            EventType::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states reported for agent instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Online,
    Offline,
    Busy,
    Idle,
    Processing,
    Completed,
    Degraded,
    Error,
    Starting,
    Stopping,
}

/// Workflow status values carried by progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

/// Heartbeat frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

/// Event-kind specific payload. Serialized internally tagged so the envelope
/// flattens into the original flat wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentStatus {
        agent_id: String,
        agent_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
        status: AgentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_status: Option<AgentState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_age: Option<f64>,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    WorkflowProgress {
        workflow_id: String,
        workflow_type: String,
        status: WorkflowStatus,
        progress_percentage: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_steps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_steps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_completion: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    SystemMetrics {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu_usage: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_usage: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_usage_mb: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_connections: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_workflows: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_queue_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_time_avg: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_rate: Option<f64>,
    },
    ProgressiveFeedback {
        operation_id: String,
        operation_type: String,
        stage: String,
        message: String,
        progress_percentage: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intermediate_result: Option<HashMap<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_remaining: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Optimization {
        optimization_type: String,
        parameter_name: String,
        old_value: Value,
        new_value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        improvement_metric: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        improvement_value: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence_score: Option<f64>,
    },
    ConnectionStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default)]
        data: HashMap<String, Value>,
    },
    Error {
        error_code: String,
        error_message: String,
        #[serde(default)]
        error_details: HashMap<String, Value>,
        #[serde(default = "default_severity")]
        severity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
    },
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        server_timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<HeartbeatKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping_id: Option<String>,
    },
}

fn default_severity() -> String {
    "error".to_string()
}

/// A single immutable event: shared envelope plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: f64,
    pub source: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: now_ts(),
            source: source.into(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::AgentStatus { .. } => EventType::AgentStatus,
            EventPayload::WorkflowProgress { .. } => EventType::WorkflowProgress,
            EventPayload::SystemMetrics { .. } => EventType::SystemMetrics,
            EventPayload::ProgressiveFeedback { .. } => EventType::ProgressiveFeedback,
            EventPayload::Optimization { .. } => EventType::Optimization,
            EventPayload::ConnectionStatus { .. } => EventType::ConnectionStatus,
            EventPayload::Error { .. } => EventType::Error,
            EventPayload::Heartbeat { .. } => EventType::Heartbeat,
        }
    }

    /// User the event is scoped to, when the payload carries one.
    pub fn user_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::WorkflowProgress { user_id, .. }
            | EventPayload::ProgressiveFeedback { user_id, .. }
            | EventPayload::ConnectionStatus { user_id, .. } => user_id.as_deref(),
            _ => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AgentStatus { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn agent_type(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AgentStatus { agent_type, .. } => Some(agent_type),
            _ => None,
        }
    }

    pub fn workflow_type(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::WorkflowProgress { workflow_type, .. } => Some(workflow_type),
            _ => None,
        }
    }

    pub fn severity(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Error { severity, .. } => Some(severity),
            _ => None,
        }
    }

    pub fn progress_percentage(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::WorkflowProgress {
                progress_percentage, ..
            }
            | EventPayload::ProgressiveFeedback {
                progress_percentage, ..
            } => Some(*progress_percentage),
            _ => None,
        }
    }

    /// Administrative connection-status event.
    pub fn connection_status(
        source: impl Into<String>,
        connection_id: Option<String>,
        status: impl Into<String>,
        user_id: Option<String>,
        data: HashMap<String, Value>,
    ) -> Self {
        Event::new(
            source,
            EventPayload::ConnectionStatus {
                connection_id,
                status: status.into(),
                user_id,
                data,
            },
        )
    }

    /// Typed error event with a stable code.
    pub fn error(
        source: impl Into<String>,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        component: Option<String>,
    ) -> Self {
        Event::new(
            source,
            EventPayload::Error {
                error_code: error_code.into(),
                error_message: error_message.into(),
                error_details: HashMap::new(),
                severity: default_severity(),
                component,
            },
        )
    }

    /// Server heartbeat frame; `kind` distinguishes ping/pong probes from
    /// plain periodic heartbeats.
    pub fn heartbeat(
        source: impl Into<String>,
        connection_id: Option<String>,
        kind: Option<HeartbeatKind>,
        ping_id: Option<String>,
    ) -> Self {
        Event::new(
            source,
            EventPayload::Heartbeat {
                connection_id,
                server_timestamp: now_ts(),
                kind,
                ping_id,
            },
        )
    }
}

/// Per-connection event filtering criteria. Absent fields always pass;
/// declared fields must match the corresponding payload attribute when the
/// event carries it. Progress bounds are in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_levels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_progress: Option<f64>,
}

impl EventFilter {
    pub fn is_empty(&self) -> bool {
        self.agent_types.is_none()
            && self.workflow_types.is_none()
            && self.user_ids.is_none()
            && self.severity_levels.is_none()
            && self.min_progress.is_none()
            && self.max_progress.is_none()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let (Some(types), Some(agent_type)) = (&self.agent_types, event.agent_type()) {
            if !types.iter().any(|t| t == agent_type) {
                return false;
            }
        }

        if let (Some(types), Some(workflow_type)) = (&self.workflow_types, event.workflow_type()) {
            if !types.iter().any(|t| t == workflow_type) {
                return false;
            }
        }

        if let (Some(ids), Some(user_id)) = (&self.user_ids, event.user_id()) {
            if !ids.iter().any(|u| u == user_id) {
                return false;
            }
        }

        if let (Some(levels), Some(severity)) = (&self.severity_levels, event.severity()) {
            if !levels.iter().any(|s| s == severity) {
                return false;
            }
        }

        if let Some(progress) = event.progress_percentage() {
            if let Some(min) = self.min_progress {
                if progress < min {
                    return false;
                }
            }
            if let Some(max) = self.max_progress {
                if progress > max {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_event(user_id: Option<&str>, progress: f64) -> Event {
        Event::new(
            "test",
            EventPayload::WorkflowProgress {
                workflow_id: "wf-1".into(),
                workflow_type: "story_generation".into(),
                status: WorkflowStatus::Running,
                progress_percentage: progress,
                current_step: Some("executing".into()),
                total_steps: Some(5),
                completed_steps: Some(2),
                estimated_completion: None,
                user_id: user_id.map(String::from),
            },
        )
    }

    #[test]
    fn test_event_round_trip_preserves_envelope_and_payload() {
        let event = workflow_event(Some("user-1"), 40.0);
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(decoded.event_type(), EventType::WorkflowProgress);
        assert_eq!(decoded.user_id(), Some("user-1"));
    }

    #[test]
    fn test_wire_format_is_flat_with_event_type_tag() {
        let event = Event::error("unit", "INVALID_JSON", "bad frame", None);
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "error");
        assert_eq!(value["error_code"], "INVALID_JSON");
        assert!(value["event_id"].is_string());
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&workflow_event(Some("u"), 10.0)));
        assert!(filter.matches(&Event::heartbeat("unit", None, None, None)));
    }

    #[test]
    fn test_filter_user_ids() {
        let filter = EventFilter {
            user_ids: Some(vec!["user-1".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&workflow_event(Some("user-1"), 10.0)));
        assert!(!filter.matches(&workflow_event(Some("user-2"), 10.0)));
        // Events without a user attribute are not excluded.
        assert!(filter.matches(&Event::heartbeat("unit", None, None, None)));
    }

    #[test]
    fn test_filter_progress_range() {
        let filter = EventFilter {
            min_progress: Some(25.0),
            max_progress: Some(75.0),
            ..Default::default()
        };
        assert!(!filter.matches(&workflow_event(None, 10.0)));
        assert!(filter.matches(&workflow_event(None, 50.0)));
        assert!(!filter.matches(&workflow_event(None, 90.0)));
    }

    #[test]
    fn test_filter_agent_types() {
        let filter = EventFilter {
            agent_types: Some(vec!["ipa".into()]),
            ..Default::default()
        };
        let event = Event::new(
            "test",
            EventPayload::AgentStatus {
                agent_id: "ipa-0".into(),
                agent_type: "ipa".into(),
                instance: None,
                status: AgentState::Processing,
                previous_status: Some(AgentState::Idle),
                heartbeat_age: None,
                metadata: HashMap::new(),
            },
        );
        assert!(filter.matches(&event));

        let other = Event::new(
            "test",
            EventPayload::AgentStatus {
                agent_id: "nga-0".into(),
                agent_type: "nga".into(),
                instance: None,
                status: AgentState::Processing,
                previous_status: None,
                heartbeat_age: None,
                metadata: HashMap::new(),
            },
        );
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::heartbeat("unit", None, None, None);
        let b = Event::heartbeat("unit", None, None, None);
        assert_ne!(a.event_id, b.event_id);
    }
}
