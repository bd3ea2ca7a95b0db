use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::AgentProxyRegistry;
use crate::performance::alerts::AlertManager;
use crate::performance::analytics::PerformanceAnalytics;
use crate::performance::monitor::LatencyMonitor;
use crate::performance::scheduler::AgentCoordinator;
use crate::platform::config::PlatformConfig;
use crate::realtime::feedback::FeedbackTracker;
use crate::realtime::gateway::BrokerGateway;
use crate::realtime::manager::ConnectionManager;
use crate::realtime::publisher::EventPublisher;
use crate::realtime::workflow::WorkflowTracker;

/// Handle to every long-lived component, threaded through services and the
/// HTTP layer. Components are explicit dependencies constructed once at
/// boot; there is no module-level mutable state.
#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: PlatformConfig,
    publisher: Arc<EventPublisher>,
    gateway: Option<Arc<BrokerGateway>>,
    connections: Arc<ConnectionManager>,
    feedback: Arc<FeedbackTracker>,
    workflows: Arc<WorkflowTracker>,
    coordinator: Arc<AgentCoordinator>,
    monitor: Arc<LatencyMonitor>,
    analytics: Arc<PerformanceAnalytics>,
    alerts: Arc<AlertManager>,
    proxies: AgentProxyRegistry,
}

impl PlatformContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PlatformConfig,
        publisher: Arc<EventPublisher>,
        gateway: Option<Arc<BrokerGateway>>,
        connections: Arc<ConnectionManager>,
        feedback: Arc<FeedbackTracker>,
        workflows: Arc<WorkflowTracker>,
        coordinator: Arc<AgentCoordinator>,
        monitor: Arc<LatencyMonitor>,
        analytics: Arc<PerformanceAnalytics>,
        alerts: Arc<AlertManager>,
        proxies: AgentProxyRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            publisher,
            gateway,
            connections,
            feedback,
            workflows,
            coordinator,
            monitor,
            analytics,
            alerts,
            proxies,
        };

        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.shared.config
    }

    pub fn publisher(&self) -> Arc<EventPublisher> {
        Arc::clone(&self.shared.publisher)
    }

    pub fn gateway(&self) -> Option<Arc<BrokerGateway>> {
        self.shared.gateway.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.shared.connections)
    }

    pub fn feedback(&self) -> Arc<FeedbackTracker> {
        Arc::clone(&self.shared.feedback)
    }

    pub fn workflows(&self) -> Arc<WorkflowTracker> {
        Arc::clone(&self.shared.workflows)
    }

    pub fn coordinator(&self) -> Arc<AgentCoordinator> {
        Arc::clone(&self.shared.coordinator)
    }

    pub fn monitor(&self) -> Arc<LatencyMonitor> {
        Arc::clone(&self.shared.monitor)
    }

    pub fn analytics(&self) -> Arc<PerformanceAnalytics> {
        Arc::clone(&self.shared.analytics)
    }

    pub fn alerts(&self) -> Arc<AlertManager> {
        Arc::clone(&self.shared.alerts)
    }

    pub fn proxies(&self) -> AgentProxyRegistry {
        self.shared.proxies.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
