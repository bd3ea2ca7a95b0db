use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::AgentProxyRegistry;
use crate::events::Event;
use crate::performance::alerts::{
    AlertManager, ConsoleNotifier, LatencyQueryEvaluator, WebhookNotifier,
};
use crate::performance::analytics::PerformanceAnalytics;
use crate::performance::integration::{PerformanceEventBridge, PublisherAlertNotifier};
use crate::performance::monitor::LatencyMonitor;
use crate::performance::scheduler::AgentCoordinator;
use crate::platform::config::PlatformConfig;
use crate::platform::context::PlatformContext;
use crate::platform::service::{ServiceFuture, ServiceRegistration};
use crate::platform::telemetry::telemetry_service;
use crate::realtime::feedback::FeedbackTracker;
use crate::realtime::gateway::{BrokerGateway, MessageHandler};
use crate::realtime::manager::ConnectionManager;
use crate::realtime::publisher::{EventPublisher, EventSink};
use crate::realtime::workflow::WorkflowTracker;
use crate::session::{InMemorySessionStore, JwtTokenVerifier, TokenVerifier};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const MONITOR_WINDOW_MINUTES: f64 = 30.0;
const MONITOR_MAX_SAMPLES: usize = 1000;

pub struct Platform {
    config: PlatformConfig,
    services: Vec<ServiceRegistration>,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        let mut services = Vec::new();
        services.push(telemetry_service(config.observability.clone()));

        Self {
            config,
            services,
            verifier: None,
        }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.services.push(service);
    }

    /// Override the default JWT verifier (tests, alternate auth backends).
    pub fn with_token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);
        let config = self.config;

        let gateway = match BrokerGateway::connect(&config.redis.url) {
            Ok(gateway) => Some(Arc::new(gateway)),
            Err(err) => {
                warn!("broker unavailable, events stay in-process only: {}", err);
                None
            }
        };

        let publisher = Arc::new(EventPublisher::new(
            config.realtime.events.clone(),
            config.realtime.enabled,
            gateway.clone(),
        ));

        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(JwtTokenVerifier::new(
                &config.auth.jwt_secret,
                Some(Arc::new(InMemorySessionStore::new())),
            )),
        };

        let connections = Arc::new(ConnectionManager::new(
            config.realtime.websocket.clone(),
            config.realtime.recovery.clone(),
            config.realtime.enabled,
            verifier,
        ));
        let sink: Arc<dyn EventSink> = Arc::clone(&connections) as Arc<dyn EventSink>;
        publisher.register_sink(sink);

        let monitor = Arc::new(LatencyMonitor::new(
            MONITOR_WINDOW_MINUTES,
            MONITOR_MAX_SAMPLES,
            config.realtime.optimization.target_response_time,
        ));
        let feedback = Arc::new(FeedbackTracker::new(
            config.realtime.progressive_feedback.clone(),
            Arc::clone(&publisher),
        ));
        let workflows = Arc::new(WorkflowTracker::new(
            &config.realtime.progressive_feedback,
            Arc::clone(&publisher),
        ));
        let coordinator = Arc::new(AgentCoordinator::new(
            config.realtime.optimization.clone(),
            Arc::clone(&monitor),
        ));
        let analytics = Arc::new(PerformanceAnalytics::default());

        let alerts = Arc::new(AlertManager::new(
            Arc::new(LatencyQueryEvaluator::new(Arc::clone(&monitor))),
            config.alerts.check_interval,
            config.alerts.cooldown,
        ));
        alerts.add_notifier(Arc::new(ConsoleNotifier));
        alerts.add_notifier(Arc::new(PublisherAlertNotifier::new(Arc::clone(&publisher))));
        if let Some(url) = &config.alerts.webhook_url {
            alerts.add_notifier(Arc::new(WebhookNotifier::new(url.clone())));
        }

        let root_token = CancellationToken::new();
        let context = PlatformContext::new(
            config.clone(),
            Arc::clone(&publisher),
            gateway.clone(),
            Arc::clone(&connections),
            feedback,
            workflows,
            coordinator,
            monitor,
            analytics,
            alerts,
            AgentProxyRegistry::new(),
            root_token.child_token(),
        );

        let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();

        // Cross-process events come back through the broker's "all" channel.
        if let Some(gateway) = &gateway {
            let handler = Arc::new(BrokerEventHandler {
                connections: Arc::clone(&connections),
            });
            let channel = format!("{}:all", config.realtime.events.redis_channel_prefix);
            let handle = gateway.subscribe(vec![channel], handler, root_token.child_token());
            tasks.push((
                "broker_subscription".to_string(),
                tokio::spawn(async move {
                    let _ = handle.await;
                    Ok(())
                }),
            ));
        }

        let mut services = self.services;
        services.extend(core_services(&config));
        for service in services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!("platform boot completed");

        Ok(PlatformRuntime {
            context,
            cancel_token: root_token,
            tasks,
        })
    }
}

/// The background loops every deployment runs. All are supervised: a fault
/// inside any loop is logged and the loop restarts after a backoff, so only
/// shutdown ends them.
fn core_services(config: &PlatformConfig) -> Vec<ServiceRegistration> {
    let mut services = vec![
        ServiceRegistration::supervised(
            "ws_heartbeat",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.connections().run_heartbeat(token).await;
                    Ok(())
                })
            }),
        ),
        ServiceRegistration::supervised(
            "ws_cleanup",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.connections().run_cleanup(token).await;
                    Ok(())
                })
            }),
        ),
        ServiceRegistration::supervised(
            "scheduler",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.coordinator().run_scheduler(token).await;
                    Ok(())
                })
            }),
        ),
        ServiceRegistration::supervised(
            "profile_refresh",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.coordinator().run_profile_refresh(token).await;
                    Ok(())
                })
            }),
        ),
        ServiceRegistration::supervised(
            "alert_checker",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.alerts().run(token).await;
                    Ok(())
                })
            }),
        ),
        ServiceRegistration::supervised(
            "metrics_bridge",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    let bridge = PerformanceEventBridge::new(
                        ctx.publisher(),
                        ctx.connections(),
                        ctx.workflows(),
                        ctx.monitor(),
                        ctx.config().alerts.metrics_broadcast_interval,
                    );
                    bridge.run(token).await;
                    Ok(())
                })
            }),
        ),
    ];

    if config.realtime.recovery.enabled {
        services.push(ServiceRegistration::supervised(
            "ws_recovery_sweep",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.connections().run_recovery_sweep(token).await;
                    Ok(())
                })
            }),
        ));
    }

    if config.realtime.progressive_feedback.enabled {
        services.push(ServiceRegistration::supervised(
            "feedback_cleanup",
            Arc::new(|ctx: PlatformContext, token: CancellationToken| -> ServiceFuture {
                Box::pin(async move {
                    ctx.feedback().run_cleanup(token).await;
                    Ok(())
                })
            }),
        ));
    }

    services
}

/// Decodes broker messages back into events and hands them to fan-out.
/// Malformed payloads are logged and dropped.
struct BrokerEventHandler {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl MessageHandler for BrokerEventHandler {
    async fn on_message(&self, channel: &str, payload: &str) {
        match serde_json::from_str::<Event>(payload) {
            Ok(event) => {
                self.connections.broadcast_event(&event, None).await;
            }
            Err(err) => {
                warn!(channel, "dropping malformed broker event: {}", err);
            }
        }
    }
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    /// Cancel every service, join with a bounded wait, then force-close the
    /// sockets that are still open.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => info!(service = %name, "service shutdown cleanly"),
                Ok(Ok(Err(err))) => error!(service = %name, "service exited with error: {}", err),
                Ok(Err(err)) => error!(service = %name, "service panicked: {}", err),
                Err(_) => warn!(service = %name, "service did not stop within the join timeout"),
            }
        }

        self.context.connections().shutdown().await;
        self.context.publisher().shutdown();
        info!("platform shutdown complete");
        Ok(())
    }
}

fn initialize_logging(config: &PlatformConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}
