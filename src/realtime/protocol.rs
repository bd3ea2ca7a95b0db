//! Client-to-server WebSocket wire protocol.
//!
//! Inbound frames are self-describing JSON records with a `type`
//! discriminator. Server-to-client traffic uses the event envelope from
//! [`crate::events`] exclusively.

use serde::{Deserialize, Serialize};

use crate::events::{EventFilter, EventType};

/// Messages a client may send. Anything else earns a typed error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Only honored while the connection awaits authentication; duplicates
    /// on an authenticated connection are ignored.
    Auth {
        token: String,
    },
    Subscribe {
        #[serde(default)]
        event_types: Vec<EventType>,
        #[serde(default)]
        filters: Option<EventFilter>,
    },
    Unsubscribe {
        #[serde(default)]
        event_types: Vec<EventType>,
    },
    SubscribeAgent {
        agent_id: String,
    },
    UnsubscribeAgent {
        agent_id: String,
    },
    UpdateFilters {
        filters: EventFilter,
    },
    Ping {
        #[serde(default)]
        ping_id: Option<String>,
    },
    Pong {
        #[serde(default)]
        ping_id: Option<String>,
    },
}

/// Discriminators this protocol understands; used to distinguish an unknown
/// message type from a malformed known one.
pub const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "auth",
    "subscribe",
    "unsubscribe",
    "subscribe_agent",
    "unsubscribe_agent",
    "update_filters",
    "ping",
    "pong",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_with_filters() {
        let raw = r#"{
            "type": "subscribe",
            "event_types": ["workflow_progress", "agent_status"],
            "filters": {"agent_types": ["ipa"], "min_progress": 10.0}
        }"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Subscribe {
                event_types,
                filters,
            } => {
                assert_eq!(
                    event_types,
                    vec![EventType::WorkflowProgress, EventType::AgentStatus]
                );
                let filters = filters.unwrap();
                assert_eq!(filters.agent_types, Some(vec!["ipa".to_string()]));
                assert_eq!(filters.min_progress, Some(10.0));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ping_without_id() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { ping_id: None }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "frobnicate"}"#).is_err());
    }
}
