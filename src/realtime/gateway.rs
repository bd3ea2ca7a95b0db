//! Broker gateway: the pub/sub bridge to Redis.
//!
//! Publishing goes through a shared auto-reconnecting connection manager.
//! Subscriptions run on a dedicated dispatch task per `subscribe` call that
//! survives broker outages with capped exponential backoff and resubscribes
//! after reconnect. Handlers must not block the receive loop; they may
//! enqueue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Callback invoked once per message on a subscribed channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, channel: &str, payload: &str);
}

pub struct BrokerGateway {
    client: redis::Client,
    publish_conn: Mutex<Option<ConnectionManager>>,
}

impl BrokerGateway {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            publish_conn: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Best-effort publish. Failure surfaces in the result; the connection
    /// manager handles reconnection behind the scenes.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publisher().await?;
        let _: () = conn.publish(channel, payload).await?;
        debug!(channel, "published broker message");
        Ok(())
    }

    /// Subscribe to a set of channels, dispatching each message to `handler`
    /// on a dedicated task. The task reconnects with exponential backoff and
    /// exits only on cancellation.
    pub fn subscribe(
        &self,
        channels: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                match Self::run_subscription(&client, &channels, &handler, &cancel).await {
                    Ok(()) => break, // cancelled
                    Err(err) => {
                        warn!("broker subscription lost: {}; retrying in {:?}", err, backoff);
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CEILING);
            }
            debug!("broker subscription task exited");
        })
    }

    async fn run_subscription(
        client: &redis::Client,
        channels: &[String],
        handler: &Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        info!(channels = channels.len(), "broker subscription established");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = stream.next() => match msg {
                    Some(msg) => {
                        let channel = msg.get_channel_name().to_string();
                        // Decoding fails closed: a bad payload is logged and
                        // dropped, never allowed to kill the loop.
                        match msg.get_payload::<String>() {
                            Ok(payload) => handler.on_message(&channel, &payload).await,
                            Err(err) => {
                                warn!(channel, "dropping undecodable broker message: {}", err);
                            }
                        }
                    }
                    None => {
                        return Err(crate::errors::FabricError::Transport(
                            "broker message stream ended".into(),
                        ));
                    }
                }
            }
        }
    }
}
