use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::platform::context::PlatformContext;

const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// What the supervisor does when a service body returns an error.
/// Background loops must survive internal faults; only shutdown or an
/// explicit run-once policy lets them end.
#[derive(Debug, Clone, Copy)]
pub enum RestartPolicy {
    /// Exit with the error; the failure surfaces at the shutdown join.
    Never,
    /// Log the error, wait out the backoff, run the body again.
    OnFailure { backoff: Duration },
}

pub type ServiceFuture = BoxFuture<'static, Result<()>>;

/// Body of one background service. Invoked by the supervisor with the
/// shared context and the service's child cancellation token, and again
/// after each fault when the policy allows restarts.
pub type ServiceTask =
    Arc<dyn Fn(PlatformContext, CancellationToken) -> ServiceFuture + Send + Sync + 'static>;

/// A named background service plus the supervision the fabric applies to it.
pub struct ServiceRegistration {
    name: String,
    restart: RestartPolicy,
    task: ServiceTask,
}

impl ServiceRegistration {
    /// A supervised service: faults are absorbed, logged, and the body is
    /// restarted after a backoff. This is the default for the fabric's
    /// long-running loops.
    pub fn supervised<N: Into<String>>(name: N, task: ServiceTask) -> Self {
        Self {
            name: name.into(),
            restart: RestartPolicy::OnFailure {
                backoff: DEFAULT_RESTART_BACKOFF,
            },
            task,
        }
    }

    /// A service that runs to completion once; an error ends it for good.
    pub fn run_once<N: Into<String>>(name: N, task: ServiceTask) -> Self {
        Self {
            name: name.into(),
            restart: RestartPolicy::Never,
            task,
        }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart = RestartPolicy::OnFailure { backoff };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the supervisor task that owns this service for the lifetime of
    /// the platform.
    pub fn spawn(
        &self,
        context: PlatformContext,
        token: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let name = self.name.clone();
        let restart = self.restart;
        let task = Arc::clone(&self.task);

        tokio::spawn(async move {
            loop {
                match (task)(context.clone(), token.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) if token.is_cancelled() => {
                        // Shutdown raced the failure; nothing to report.
                        info!(service = %name, "service stopped during shutdown: {}", err);
                        return Ok(());
                    }
                    Err(err) => match restart {
                        RestartPolicy::Never => return Err(err),
                        RestartPolicy::OnFailure { backoff } => {
                            error!(
                                service = %name,
                                "service failed: {}; restarting in {:?}", err, backoff
                            );
                            tokio::select! {
                                _ = token.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    },
                }
            }
        })
    }
}
