//! Agent contracts used by the scheduler and dispatch path.
//!
//! The fabric never hosts agent logic itself. It sees a pool of agent
//! instances through the [`AgentProxy`] capability: one proxy per running
//! instance, keyed by agent id, typed by [`AgentKind`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

/// The stages of the narrative pipeline an agent can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    /// Input parsing ("ipa").
    #[serde(rename = "ipa")]
    InputProcessor,
    /// World state modeling ("wba").
    #[serde(rename = "wba")]
    WorldBuilder,
    /// Narrative generation ("nga").
    #[serde(rename = "nga")]
    NarrativeGenerator,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::InputProcessor => "ipa",
            AgentKind::WorldBuilder => "wba",
            AgentKind::NarrativeGenerator => "nga",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work handed to an agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: String,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    pub input: Value,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// What an agent hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub request_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: Value,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Local handle for dispatching work to one agent instance, regardless of
/// transport. Implementations must honor the cancellation token.
#[async_trait]
pub trait AgentProxy: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn invoke(&self, request: AgentRequest, cancel: CancellationToken)
        -> Result<AgentResult>;
}

/// Registry of live agent proxies, keyed by agent id.
#[derive(Clone, Default)]
pub struct AgentProxyRegistry {
    proxies: Arc<RwLock<HashMap<String, Arc<dyn AgentProxy>>>>,
}

impl AgentProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<String>, proxy: Arc<dyn AgentProxy>) {
        self.proxies.write().insert(agent_id.into(), proxy);
    }

    pub fn deregister(&self, agent_id: &str) {
        self.proxies.write().remove(agent_id);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentProxy>> {
        self.proxies.read().get(agent_id).cloned()
    }

    pub fn by_kind(&self, kind: AgentKind) -> Vec<(String, Arc<dyn AgentProxy>)> {
        self.proxies
            .read()
            .iter()
            .filter(|(_, proxy)| proxy.kind() == kind)
            .map(|(id, proxy)| (id.clone(), Arc::clone(proxy)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProxy(AgentKind);

    #[async_trait]
    impl AgentProxy for EchoProxy {
        fn kind(&self) -> AgentKind {
            self.0
        }

        async fn invoke(
            &self,
            request: AgentRequest,
            _cancel: CancellationToken,
        ) -> Result<AgentResult> {
            Ok(AgentResult {
                request_id: request.request_id,
                agent_id: "echo".into(),
                success: true,
                output: request.input,
                duration: 0.0,
                error: None,
            })
        }
    }

    #[test]
    fn test_agent_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&AgentKind::InputProcessor).unwrap(),
            "\"ipa\""
        );
        assert_eq!(
            serde_json::from_str::<AgentKind>("\"nga\"").unwrap(),
            AgentKind::NarrativeGenerator
        );
    }

    #[test]
    fn test_registry_lookup_by_kind() {
        let registry = AgentProxyRegistry::new();
        registry.register("ipa-0", Arc::new(EchoProxy(AgentKind::InputProcessor)));
        registry.register("wba-0", Arc::new(EchoProxy(AgentKind::WorldBuilder)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_kind(AgentKind::InputProcessor).len(), 1);
        assert!(registry.by_kind(AgentKind::NarrativeGenerator).is_empty());

        registry.deregister("ipa-0");
        assert!(registry.by_kind(AgentKind::InputProcessor).is_empty());
    }
}
