use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics;
use crate::platform::config::ObservabilitySettings;
use crate::platform::service::{ServiceFuture, ServiceRegistration};

/// Prometheus exposition endpoint, supervised like every other service so a
/// failed bind retries instead of silently losing metrics.
pub fn telemetry_service(settings: ObservabilitySettings) -> ServiceRegistration {
    ServiceRegistration::supervised(
        "telemetry",
        Arc::new(move |_ctx, token: CancellationToken| -> ServiceFuture {
            Box::pin(serve_metrics(settings.clone(), token))
        }),
    )
}

async fn serve_metrics(settings: ObservabilitySettings, shutdown: CancellationToken) -> Result<()> {
    if !settings.enable_metrics {
        // Disabled by configuration; hold the service open until shutdown so
        // the supervisor does not treat this as completion churn.
        shutdown.cancelled().await;
        return Ok(());
    }

    let router = Router::new().route("/metrics", get(|| async { metrics::gather() }));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    info!("metrics endpoint stopped");
    Ok(())
}
