use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use storyweave_core::platform::{Platform, PlatformConfig, PlatformContext};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Port to bind the realtime API to
    #[arg(short, long, default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PlatformConfig::load_from_path(Some(path))?,
        None => PlatformConfig::load()?,
    };
    let ws_path = config.realtime.websocket.path.clone();

    let runtime = Platform::new(config).start().await?;
    let context = runtime.context();

    let app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/analysis", get(analysis))
        .route("/alerts", get(alerts))
        .with_state(context);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("orchestrator listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    runtime.shutdown().await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(context): State<PlatformContext>,
) -> Response {
    if !context.config().realtime.enabled {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let token = params
        .get("token")
        .cloned()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let manager = context.connections();
    ws.on_upgrade(move |socket| manager.handle_socket(socket, token))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?;
    Some(token.to_string())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": storyweave_core::events::now_ts(),
    }))
}

async fn status(State(context): State<PlatformContext>) -> impl IntoResponse {
    let connections = context.connections().status().await;
    Json(serde_json::json!({
        "connections": connections,
        "publisher": context.publisher().stats(),
        "scheduler": context.coordinator().stats(),
        "feedback": context.feedback().stats().await,
    }))
}

async fn analysis(State(context): State<PlatformContext>) -> impl IntoResponse {
    let report = context.analytics().analyze(&context.monitor());
    Json(report)
}

async fn alerts(State(context): State<PlatformContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "active": context.alerts().active_alerts(),
        "history": context.alerts().alert_history(100),
    }))
}
