//! WebSocket connection manager: lifecycle, authentication, heartbeat
//! health, subscription handling, fan-out, and reconnect recovery.
//!
//! Each connection gets exactly one reader task and one writer task. The
//! reader owns all subscription-state mutation; the writer drains the
//! bounded outbound queue. The manager itself runs three background loops:
//! heartbeat pings, stale-connection cleanup, and recovery-cache sweeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{close, Result};
use crate::events::{now_ts, Event, EventFilter, EventType, HeartbeatKind};
use crate::metrics;
use crate::platform::config::{RecoverySettings, WebSocketSettings};
use crate::realtime::connection::{Connection, ConnectionSnapshot, RecoverySnapshot};
use crate::realtime::protocol::{ClientMessage, KNOWN_MESSAGE_TYPES};
use crate::realtime::publisher::EventSink;
use crate::session::TokenVerifier;

const SOURCE: &str = "connection_manager";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SEEN_EVENTS_CAP: usize = 4096;

/// Bounded memory of recently fanned-out event ids. An event can arrive
/// twice, once from the in-process publisher sink and once echoed back over
/// the broker subscription; delivery is at most once per connection.
#[derive(Default)]
struct SeenEvents {
    order: VecDeque<String>,
    set: HashSet<String>,
}

/// Manager status snapshot for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub unique_users: usize,
    pub recoverable_users: usize,
    pub connections: Vec<ConnectionSnapshot>,
}

pub struct ConnectionManager {
    websocket: WebSocketSettings,
    recovery_cfg: RecoverySettings,
    enabled: bool,
    verifier: Arc<dyn TokenVerifier>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    user_connections: RwLock<HashMap<String, HashSet<String>>>,
    recovery: RwLock<HashMap<String, RecoverySnapshot>>,
    seen_events: parking_lot::Mutex<SeenEvents>,
}

impl ConnectionManager {
    pub fn new(
        websocket: WebSocketSettings,
        recovery: RecoverySettings,
        enabled: bool,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            websocket,
            recovery_cfg: recovery,
            enabled,
            verifier,
            connections: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
            recovery: RwLock::new(HashMap::new()),
            seen_events: parking_lot::Mutex::new(SeenEvents::default()),
        }
    }

    fn first_sighting(&self, event_id: &str) -> bool {
        let mut seen = self.seen_events.lock();
        if seen.set.contains(event_id) {
            return false;
        }
        seen.set.insert(event_id.to_string());
        seen.order.push_back(event_id.to_string());
        if seen.order.len() > SEEN_EVENTS_CAP {
            if let Some(oldest) = seen.order.pop_front() {
                seen.set.remove(&oldest);
            }
        }
        true
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn has_capacity(&self) -> bool {
        self.connections.read().await.len() < self.websocket.max_connections
    }

    /// Drive a freshly upgraded socket through its whole lifecycle. Returns
    /// when the connection is closed and removed.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, token_hint: Option<String>) {
        if !self.enabled {
            metrics::CONNECTIONS_REFUSED.inc();
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close::POLICY_VIOLATION,
                    reason: "realtime disabled".into(),
                })))
                .await;
            return;
        }

        if !self.has_capacity().await {
            metrics::CONNECTIONS_REFUSED.inc();
            warn!(
                max_connections = self.websocket.max_connections,
                "refusing connection, limit reached"
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close::POLICY_VIOLATION,
                    reason: "connection limit exceeded".into(),
                })))
                .await;
            return;
        }

        let connection_id = Uuid::new_v4().simple().to_string();
        let conn = Arc::new(Connection::new(
            &connection_id,
            self.websocket.outbound_queue_size,
        ));
        self.register(Arc::clone(&conn)).await;
        info!(connection_id = %connection_id, "websocket connection established");

        let (sender, mut receiver) = socket.split();
        let writer = tokio::spawn(write_loop(Arc::clone(&conn), sender));

        conn.send_control_event(&Event::connection_status(
            SOURCE,
            Some(connection_id.clone()),
            "connected",
            None,
            HashMap::new(),
        ));

        let authenticated = if self.websocket.auth_required {
            self.authenticate(&conn, token_hint, &mut receiver).await
        } else {
            conn.mark_anonymous();
            true
        };

        if authenticated {
            self.read_loop(&conn, &mut receiver).await;
        } else {
            conn.send_close(close::POLICY_VIOLATION, "authentication failed");
        }

        self.remove_connection(&conn).await;
        let _ = writer.await;
        info!(connection_id = %connection_id, "websocket connection closed");
    }

    async fn register(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        connections.insert(conn.connection_id.clone(), conn);
        metrics::ACTIVE_CONNECTIONS.set(connections.len() as f64);
    }

    // ---- authentication -------------------------------------------------

    async fn authenticate(
        &self,
        conn: &Arc<Connection>,
        token_hint: Option<String>,
        receiver: &mut SplitStream<WebSocket>,
    ) -> bool {
        let token = match token_hint.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => match self.await_auth_message(conn, receiver).await {
                Some(token) => token,
                None => return false,
            },
        };

        let claims = match self.verifier.verify(&token).await {
            Ok(claims) => claims,
            Err(err) => {
                warn!(connection_id = %conn.connection_id, "authentication failed: {}", err);
                self.send_error(conn, "INVALID_TOKEN", &format!("token verification failed: {err}"));
                return false;
            }
        };

        conn.mark_authenticated(&claims);
        {
            let mut users = self.user_connections.write().await;
            users
                .entry(claims.user_id.clone())
                .or_default()
                .insert(conn.connection_id.clone());
        }

        let mut data = HashMap::new();
        data.insert("user_id".to_string(), json!(claims.user_id));
        if let Some(username) = &claims.username {
            data.insert("username".to_string(), json!(username));
        }
        conn.send_control_event(&Event::connection_status(
            SOURCE,
            Some(conn.connection_id.clone()),
            "authenticated",
            Some(claims.user_id.clone()),
            data,
        ));

        let recovered = if self.recovery_cfg.enabled {
            self.try_recover(conn).await
        } else {
            false
        };
        if !recovered {
            info!(
                connection_id = %conn.connection_id,
                user_id = %claims.user_id,
                "websocket connection authenticated"
            );
        }

        true
    }

    async fn await_auth_message(
        &self,
        conn: &Arc<Connection>,
        receiver: &mut SplitStream<WebSocket>,
    ) -> Option<String> {
        let deadline = Duration::from_secs_f64(self.websocket.auth_timeout);
        let frame = match tokio::time::timeout(deadline, receiver.next()).await {
            Err(_) => {
                self.send_error(conn, "AUTH_TIMEOUT", "authentication timeout");
                return None;
            }
            Ok(frame) => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Auth { token }) if !token.is_empty() => Some(token),
                Ok(ClientMessage::Auth { .. }) => {
                    self.send_error(conn, "INVALID_TOKEN", "token required");
                    None
                }
                Ok(_) => {
                    self.send_error(conn, "AUTH_REQUIRED", "authentication required");
                    None
                }
                Err(_) => {
                    self.send_error(conn, "INVALID_JSON", "invalid JSON in authentication message");
                    None
                }
            },
            Some(Ok(_)) => {
                self.send_error(conn, "AUTH_REQUIRED", "authentication required");
                None
            }
            _ => None,
        }
    }

    // ---- recovery -------------------------------------------------------

    async fn try_recover(&self, conn: &Arc<Connection>) -> bool {
        let Some(user_id) = conn.user_id() else {
            return false;
        };

        let snapshot = {
            let mut recovery = self.recovery.write().await;
            match recovery.get(&user_id) {
                Some(snapshot) if snapshot.age() <= self.recovery_cfg.timeout => {
                    recovery.remove(&user_id)
                }
                _ => None,
            }
        };
        let Some(snapshot) = snapshot else {
            return false;
        };

        conn.restore_subscriptions(snapshot.subscriptions.clone());
        conn.set_filter(snapshot.filter.clone());
        conn.restore_agent_scope(snapshot.agent_scope.clone());

        let mut data = HashMap::new();
        data.insert(
            "recovered_subscriptions".to_string(),
            json!(snapshot
                .subscriptions
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()),
        );
        data.insert(
            "recovered_filters".to_string(),
            serde_json::to_value(&snapshot.filter).unwrap_or_default(),
        );
        data.insert("recovery_time".to_string(), json!(now_ts()));
        conn.send_control_event(&Event::connection_status(
            SOURCE,
            Some(conn.connection_id.clone()),
            "recovered",
            Some(user_id.clone()),
            data,
        ));

        info!(
            connection_id = %conn.connection_id,
            user_id = %user_id,
            "connection state recovered"
        );
        true
    }

    async fn remove_connection(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(&conn.connection_id);
            metrics::ACTIVE_CONNECTIONS.set(connections.len() as f64);
            removed
        };
        if removed.is_none() {
            return;
        }

        if let Some(user_id) = conn.user_id() {
            {
                let mut users = self.user_connections.write().await;
                if let Some(set) = users.get_mut(&user_id) {
                    set.remove(&conn.connection_id);
                    if set.is_empty() {
                        users.remove(&user_id);
                    }
                }
            }

            if self.recovery_cfg.enabled && conn.is_authenticated() {
                self.recovery.write().await.insert(
                    user_id,
                    RecoverySnapshot {
                        subscriptions: conn.subscriptions(),
                        filter: conn.filter(),
                        agent_scope: conn.agent_scope(),
                        disconnected_at: Instant::now(),
                    },
                );
            }
        }

        conn.outbound.close();
        info!(connection_id = %conn.connection_id, "websocket connection removed");
    }

    // ---- inbound protocol -----------------------------------------------

    async fn read_loop(&self, conn: &Arc<Connection>, receiver: &mut SplitStream<WebSocket>) {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    conn.touch_recv();
                    self.handle_client_text(conn, &text);
                }
                Ok(Message::Binary(_)) => {
                    conn.touch_recv();
                    self.send_error(conn, "UNKNOWN_MESSAGE_TYPE", "binary frames are not supported");
                }
                Ok(Message::Ping(_)) => conn.touch_recv(),
                Ok(Message::Pong(_)) => {
                    conn.touch_recv();
                    conn.record_pong();
                }
                Ok(Message::Close(_)) => break,
                Err(err) => {
                    debug!(connection_id = %conn.connection_id, "socket read error: {}", err);
                    break;
                }
            }
        }
    }

    fn handle_client_text(&self, conn: &Arc<Connection>, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                self.send_error(conn, "INVALID_JSON", "invalid JSON message");
                return;
            }
        };
        let message_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let message = match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => message,
            Err(err) => {
                match message_type.as_deref() {
                    Some(t) if !KNOWN_MESSAGE_TYPES.contains(&t) => {
                        self.send_error(
                            conn,
                            "UNKNOWN_MESSAGE_TYPE",
                            &format!("unknown message type: {t}"),
                        );
                    }
                    Some(_) => {
                        self.send_error(conn, "MESSAGE_ERROR", &format!("malformed message: {err}"));
                    }
                    None => self.send_error(conn, "INVALID_JSON", "message is missing a type"),
                }
                return;
            }
        };

        match message {
            ClientMessage::Auth { .. } => {
                // Already authenticated by the time the read loop runs.
                debug!(connection_id = %conn.connection_id, "ignoring duplicate auth message");
            }
            ClientMessage::Subscribe {
                event_types,
                filters,
            } => self.handle_subscribe(conn, event_types, filters),
            ClientMessage::Unsubscribe { event_types } => {
                for event_type in &event_types {
                    conn.unsubscribe(*event_type);
                }
                let mut data = HashMap::new();
                data.insert(
                    "event_types".to_string(),
                    json!(event_types.iter().map(|t| t.as_str()).collect::<Vec<_>>()),
                );
                self.send_status(conn, "unsubscribed", data);
            }
            ClientMessage::SubscribeAgent { agent_id } => {
                conn.subscribe_agent(agent_id.clone());
                // Following an agent implies agent status events.
                conn.subscribe(EventType::AgentStatus);
                let mut data = HashMap::new();
                data.insert("agent_id".to_string(), json!(agent_id));
                self.send_status(conn, "agent_subscribed", data);
            }
            ClientMessage::UnsubscribeAgent { agent_id } => {
                conn.unsubscribe_agent(&agent_id);
                let mut data = HashMap::new();
                data.insert("agent_id".to_string(), json!(agent_id));
                self.send_status(conn, "agent_unsubscribed", data);
            }
            ClientMessage::UpdateFilters { filters } => {
                let sanitized = self.sanitize_filter(conn, filters);
                conn.set_filter(sanitized.clone());
                let mut data = HashMap::new();
                data.insert(
                    "filters".to_string(),
                    serde_json::to_value(&sanitized).unwrap_or_default(),
                );
                self.send_status(conn, "filters_updated", data);
            }
            ClientMessage::Ping { ping_id } => {
                conn.send_control_event(&Event::heartbeat(
                    SOURCE,
                    Some(conn.connection_id.clone()),
                    Some(HeartbeatKind::Pong),
                    ping_id,
                ));
            }
            ClientMessage::Pong { ping_id: _ } => {
                // Echoed ids are informational; a pong without one still counts.
                conn.record_pong();
            }
        }
    }

    fn handle_subscribe(
        &self,
        conn: &Arc<Connection>,
        event_types: Vec<EventType>,
        filters: Option<EventFilter>,
    ) {
        let mut authorized = Vec::new();
        let mut unauthorized = Vec::new();
        for event_type in event_types {
            if self.authorized_for_event_type(conn, event_type) {
                conn.subscribe(event_type);
                authorized.push(event_type);
            } else {
                unauthorized.push(event_type);
            }
        }

        let mut data = HashMap::new();
        data.insert(
            "authorized_event_types".to_string(),
            json!(authorized.iter().map(|t| t.as_str()).collect::<Vec<_>>()),
        );
        if let Some(filters) = filters {
            let sanitized = self.sanitize_filter(conn, filters);
            conn.set_filter(sanitized.clone());
            data.insert(
                "filters".to_string(),
                serde_json::to_value(&sanitized).unwrap_or_default(),
            );
        }
        if !unauthorized.is_empty() {
            data.insert(
                "unauthorized_event_types".to_string(),
                json!(unauthorized.iter().map(|t| t.as_str()).collect::<Vec<_>>()),
            );
            data.insert(
                "warning".to_string(),
                json!("some event types were not authorized for this principal"),
            );
        }
        self.send_status(conn, "subscribed", data);
    }

    // ---- authorization --------------------------------------------------

    fn authorized_for_event_type(&self, conn: &Connection, event_type: EventType) -> bool {
        match event_type {
            // Basic tier.
            EventType::ConnectionStatus | EventType::Heartbeat | EventType::Error => {
                conn.is_authenticated()
            }
            // User-scoped tier; filter sanitization pins these to the
            // principal's own user id.
            EventType::AgentStatus | EventType::WorkflowProgress | EventType::ProgressiveFeedback => {
                conn.is_authenticated()
            }
            // System tier. Policy hook: restrict to admin once role-based
            // elevation is defined.
            EventType::SystemMetrics | EventType::Optimization => conn.is_authenticated(),
        }
    }

    fn authorized_for_agent(&self, conn: &Connection, _agent_id: &str) -> bool {
        // Policy hook; today any authenticated principal may follow any agent.
        conn.is_authenticated()
    }

    /// A non-admin principal may only filter on its own user id; anything
    /// else is rewritten, not rejected.
    fn sanitize_filter(&self, conn: &Connection, mut filter: EventFilter) -> EventFilter {
        if filter.user_ids.is_some() && !conn.is_admin() {
            if let Some(own) = conn.user_id() {
                let requested = filter.user_ids.take().unwrap_or_default();
                if requested.len() != 1 || requested[0] != own {
                    warn!(
                        connection_id = %conn.connection_id,
                        "rewriting user_id filter to the principal's own id"
                    );
                }
                filter.user_ids = Some(vec![own]);
            }
        }
        filter
    }

    // ---- fan-out --------------------------------------------------------

    fn should_deliver(
        &self,
        conn: &Connection,
        event: &Event,
        user_filter: Option<&HashSet<String>>,
    ) -> bool {
        if !conn.is_authenticated() {
            return false;
        }
        if let Some(user_filter) = user_filter {
            match conn.user_id() {
                Some(user_id) if user_filter.contains(&user_id) => {}
                _ => return false,
            }
        }
        if !conn.is_subscribed(event.event_type()) {
            return false;
        }
        if !self.authorized_for_event_type(conn, event.event_type()) {
            return false;
        }
        if !conn.filter_matches(event) {
            return false;
        }
        if let Some(agent_id) = event.agent_id() {
            if !self.authorized_for_agent(conn, agent_id) {
                return false;
            }
        }
        true
    }

    /// Deliver an event to every connection that passes authorization and
    /// filtering. Returns the number of connections enqueued to.
    pub async fn broadcast_event(
        &self,
        event: &Event,
        user_filter: Option<&HashSet<String>>,
    ) -> usize {
        if !self.first_sighting(&event.event_id) {
            debug!(event_id = %event.event_id, "skipping already-delivered event");
            return 0;
        }

        let encoded = match serde_json::to_string(event) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("failed to encode broadcast event: {}", err);
                return 0;
            }
        };

        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();

        let mut sent = 0;
        for conn in connections {
            if self.should_deliver(&conn, event, user_filter) && conn.send_serialized(encoded.clone())
            {
                sent += 1;
                metrics::FRAMES_ENQUEUED.inc();
            }
        }
        sent
    }

    fn send_status(&self, conn: &Connection, status: &str, data: HashMap<String, serde_json::Value>) {
        conn.send_control_event(&Event::connection_status(
            SOURCE,
            Some(conn.connection_id.clone()),
            status,
            conn.user_id(),
            data,
        ));
    }

    fn send_error(&self, conn: &Connection, error_code: &str, error_message: &str) {
        conn.send_control_event(&Event::error(
            SOURCE,
            error_code,
            error_message,
            Some(SOURCE.to_string()),
        ));
    }

    // ---- background loops -----------------------------------------------

    /// Heartbeat loop: pings quiet connections and tracks missed pongs.
    pub async fn run_heartbeat(&self, cancel: CancellationToken) {
        let interval = self.websocket.heartbeat_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {
                    self.heartbeat_pass().await;
                }
            }
        }
        debug!("heartbeat loop exited");
    }

    async fn heartbeat_pass(&self) {
        let interval = self.websocket.heartbeat_interval;
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();

        for conn in connections {
            let silence = conn.pong_silence();
            if silence <= interval {
                continue;
            }

            let seq = conn.next_ping_seq();
            let ping = Event::heartbeat(
                SOURCE,
                Some(conn.connection_id.clone()),
                Some(HeartbeatKind::Ping),
                Some(format!("ping_{seq}")),
            );
            if conn.send_control_event(&ping) {
                if silence > interval * 2.0 {
                    let missed = conn.note_missed_pong();
                    warn!(
                        connection_id = %conn.connection_id,
                        missed, "connection missed pong"
                    );
                }
                // Plain heartbeat every third ping cycle for clients that do
                // not implement the ping protocol.
                if seq % 3 == 0 {
                    conn.send_control_event(&Event::heartbeat(
                        SOURCE,
                        Some(conn.connection_id.clone()),
                        None,
                        None,
                    ));
                }
            }
        }
    }

    /// Cleanup loop: evicts idle, pong-silent, and unhealthy connections.
    pub async fn run_cleanup(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    self.evict_stale().await;
                }
            }
        }
        debug!("cleanup loop exited");
    }

    async fn evict_stale(&self) {
        let timeout = self.websocket.connection_timeout;
        let stale: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|conn| {
                conn.idle_for() > timeout
                    || conn.missed_pongs() > 5
                    || conn.pong_silence() > timeout * 2.0
            })
            .cloned()
            .collect();

        let evicted = stale.len();
        for conn in stale {
            warn!(
                connection_id = %conn.connection_id,
                missed_pongs = conn.missed_pongs(),
                idle = conn.idle_for(),
                "evicting stale connection"
            );
            conn.send_close(close::TIMEOUT, "timeout");
            self.remove_connection(&conn).await;
            metrics::CONNECTIONS_EVICTED.inc();
        }
        if evicted > 0 {
            info!(evicted, "cleaned up stale connections");
        }
    }

    /// Recovery sweep: drops snapshots older than the recovery timeout.
    pub async fn run_recovery_sweep(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECOVERY_SWEEP_INTERVAL) => {
                    self.sweep_recovery().await;
                }
            }
        }
        debug!("recovery sweep exited");
    }

    async fn sweep_recovery(&self) {
        let timeout = self.recovery_cfg.timeout;
        let mut recovery = self.recovery.write().await;
        let before = recovery.len();
        recovery.retain(|_, snapshot| snapshot.age() <= timeout);
        let expired = before - recovery.len();
        if expired > 0 {
            info!(expired, "cleaned up expired recovery snapshots");
        }
    }

    /// Close every connection with the normal close code and clear state.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut map = self.connections.write().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &connections {
            conn.send_close(close::NORMAL, "server shutdown");
        }
        self.user_connections.write().await.clear();
        self.recovery.write().await.clear();
        metrics::ACTIVE_CONNECTIONS.set(0.0);
        info!(closed = connections.len(), "connection manager shut down");
    }

    pub async fn status(&self) -> ManagerStatus {
        let connections = self.connections.read().await;
        let recovery = self.recovery.read().await;
        let snapshots: Vec<ConnectionSnapshot> = connections
            .values()
            .map(|conn| {
                conn.snapshot(
                    self.websocket.heartbeat_interval,
                    self.websocket.connection_timeout,
                )
            })
            .collect();
        ManagerStatus {
            total_connections: connections.len(),
            authenticated_connections: snapshots.iter().filter(|s| s.authenticated).count(),
            unique_users: self.user_connections.read().await.len(),
            recoverable_users: recovery
                .values()
                .filter(|s| s.age() <= self.recovery_cfg.timeout)
                .count(),
            connections: snapshots,
        }
    }
}

#[async_trait]
impl EventSink for ConnectionManager {
    async fn deliver(&self, event: &Event) -> Result<usize> {
        Ok(self.broadcast_event(event, None).await)
    }
}

async fn write_loop(conn: Arc<Connection>, mut sender: SplitSink<WebSocket, Message>) {
    while let Some(frame) = conn.outbound.next().await {
        match frame {
            crate::realtime::connection::OutboundFrame::Text { text, .. } => {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            crate::realtime::connection::OutboundFrame::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::realtime::connection::OutboundFrame;
    use crate::session::{StaticTokenVerifier, TokenClaims};

    fn test_manager() -> Arc<ConnectionManager> {
        let websocket = WebSocketSettings {
            max_connections: 4,
            outbound_queue_size: 16,
            ..WebSocketSettings::default()
        };
        Arc::new(ConnectionManager::new(
            websocket,
            RecoverySettings::default(),
            true,
            Arc::new(StaticTokenVerifier::new().with_token("t1", "user-1")),
        ))
    }

    fn claims(user_id: &str) -> TokenClaims {
        TokenClaims {
            user_id: user_id.to_string(),
            username: None,
            email: None,
            roles: Vec::new(),
            expires_at: None,
        }
    }

    async fn authed_connection(manager: &ConnectionManager, user_id: &str) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(format!("conn-{user_id}"), 16));
        conn.mark_authenticated(&claims(user_id));
        manager.register(Arc::clone(&conn)).await;
        conn
    }

    fn workflow_event(user_id: &str) -> Event {
        Event::new(
            "test",
            EventPayload::WorkflowProgress {
                workflow_id: "wf-1".into(),
                workflow_type: "story_generation".into(),
                status: crate::events::WorkflowStatus::Running,
                progress_percentage: 50.0,
                current_step: None,
                total_steps: None,
                completed_steps: None,
                estimated_completion: None,
                user_id: Some(user_id.to_string()),
            },
        )
    }

    async fn drain_texts(conn: &Connection) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(frame) = {
            let frames = conn.outbound.len();
            if frames == 0 {
                None
            } else {
                conn.outbound.next().await
            }
        } {
            if let OutboundFrame::Text { text, .. } = frame {
                texts.push(text);
            }
        }
        texts
    }

    #[tokio::test]
    async fn test_broadcast_requires_subscription() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        let sent = manager.broadcast_event(&workflow_event("user-1"), None).await;
        assert_eq!(sent, 0);

        conn.subscribe(EventType::WorkflowProgress);
        let sent = manager.broadcast_event(&workflow_event("user-1"), None).await;
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_delivered_once() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;
        conn.subscribe(EventType::WorkflowProgress);

        let event = workflow_event("user-1");
        assert_eq!(manager.broadcast_event(&event, None).await, 1);
        // The same event echoed back over the broker subscription.
        assert_eq!(manager.broadcast_event(&event, None).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unauthenticated() {
        let manager = test_manager();
        let conn = Arc::new(Connection::new("anon", 16));
        conn.subscribe(EventType::WorkflowProgress);
        manager.register(Arc::clone(&conn)).await;

        let sent = manager.broadcast_event(&workflow_event("user-1"), None).await;
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_user_filter_restricts_delivery() {
        let manager = test_manager();
        let one = authed_connection(&manager, "user-1").await;
        let two = authed_connection(&manager, "user-2").await;
        one.subscribe(EventType::WorkflowProgress);
        two.subscribe(EventType::WorkflowProgress);

        let only_two: HashSet<String> = ["user-2".to_string()].into_iter().collect();
        let sent = manager
            .broadcast_event(&workflow_event("user-2"), Some(&only_two))
            .await;
        assert_eq!(sent, 1);
        assert!(one.outbound.is_empty());
        assert!(!two.outbound.is_empty());
    }

    #[tokio::test]
    async fn test_filter_sanitization_rewrites_foreign_user_ids() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        let requested = EventFilter {
            user_ids: Some(vec!["user-1".into(), "user-2".into()]),
            ..Default::default()
        };
        let sanitized = manager.sanitize_filter(&conn, requested);
        assert_eq!(sanitized.user_ids, Some(vec!["user-1".to_string()]));

        conn.subscribe(EventType::WorkflowProgress);
        conn.set_filter(sanitized);

        // Another user's workflow must not reach this connection.
        assert_eq!(manager.broadcast_event(&workflow_event("user-2"), None).await, 0);
        assert_eq!(manager.broadcast_event(&workflow_event("user-1"), None).await, 1);
    }

    #[tokio::test]
    async fn test_admin_filter_is_not_rewritten() {
        let manager = test_manager();
        let conn = Arc::new(Connection::new("admin-conn", 16));
        let mut admin = claims("admin-1");
        admin.roles.push("admin".into());
        conn.mark_authenticated(&admin);
        manager.register(Arc::clone(&conn)).await;

        let requested = EventFilter {
            user_ids: Some(vec!["user-1".into(), "user-2".into()]),
            ..Default::default()
        };
        let sanitized = manager.sanitize_filter(&conn, requested.clone());
        assert_eq!(sanitized.user_ids, requested.user_ids);
    }

    #[tokio::test]
    async fn test_subscribe_message_partitions_and_confirms() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        manager.handle_client_text(
            &conn,
            r#"{"type": "subscribe", "event_types": ["workflow_progress"]}"#,
        );
        assert!(conn.is_subscribed(EventType::WorkflowProgress));

        let texts = drain_texts(&conn).await;
        let confirmation: Event = serde_json::from_str(&texts[0]).unwrap();
        match confirmation.payload {
            EventPayload::ConnectionStatus { status, data, .. } => {
                assert_eq!(status, "subscribed");
                assert_eq!(
                    data["authorized_event_types"],
                    json!(["workflow_progress"])
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_message_type_yields_typed_error() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        manager.handle_client_text(&conn, r#"{"type": "frobnicate"}"#);
        let texts = drain_texts(&conn).await;
        let event: Event = serde_json::from_str(&texts[0]).unwrap();
        match event.payload {
            EventPayload::Error { error_code, .. } => {
                assert_eq!(error_code, "UNKNOWN_MESSAGE_TYPE");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_yields_typed_error() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        manager.handle_client_text(&conn, "{not json");
        let texts = drain_texts(&conn).await;
        let event: Event = serde_json::from_str(&texts[0]).unwrap();
        match event.payload {
            EventPayload::Error { error_code, .. } => assert_eq!(error_code, "INVALID_JSON"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_ping_echoes_pong_with_id() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;

        manager.handle_client_text(&conn, r#"{"type": "ping", "ping_id": "p7"}"#);
        let texts = drain_texts(&conn).await;
        let event: Event = serde_json::from_str(&texts[0]).unwrap();
        match event.payload {
            EventPayload::Heartbeat { kind, ping_id, .. } => {
                assert_eq!(kind, Some(HeartbeatKind::Pong));
                assert_eq!(ping_id.as_deref(), Some("p7"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_connection_snapshots_and_recover_restores() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;
        conn.subscribe(EventType::AgentStatus);
        conn.set_filter(EventFilter {
            agent_types: Some(vec!["ipa".into()]),
            ..Default::default()
        });

        manager.remove_connection(&conn).await;
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.recovery.read().await.contains_key("user-1"));

        // A reconnect for the same user restores the snapshot and consumes it.
        let fresh = authed_connection(&manager, "user-1").await;
        assert!(manager.try_recover(&fresh).await);
        assert!(fresh.is_subscribed(EventType::AgentStatus));
        assert_eq!(fresh.filter().agent_types, Some(vec!["ipa".to_string()]));
        assert!(!manager.recovery.read().await.contains_key("user-1"));

        let texts = drain_texts(&fresh).await;
        let event: Event = serde_json::from_str(&texts[0]).unwrap();
        match event.payload {
            EventPayload::ConnectionStatus { status, data, .. } => {
                assert_eq!(status, "recovered");
                assert_eq!(data["recovered_subscriptions"], json!(["agent_status"]));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_expires_after_timeout_sweep() {
        let websocket = WebSocketSettings::default();
        let manager = Arc::new(ConnectionManager::new(
            websocket,
            RecoverySettings {
                enabled: true,
                timeout: 0.0,
            },
            true,
            Arc::new(StaticTokenVerifier::new()),
        ));
        let conn = authed_connection(&manager, "user-1").await;
        manager.remove_connection(&conn).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.sweep_recovery().await;
        assert!(manager.recovery.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_after_missed_pongs() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;
        for _ in 0..6 {
            conn.note_missed_pong();
        }

        manager.evict_stale().await;
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_connections() {
        let manager = test_manager();
        let conn = authed_connection(&manager, "user-1").await;
        manager.shutdown().await;
        assert_eq!(manager.active_count().await, 0);

        // Writer would see the close frame last.
        let mut saw_close = false;
        while let Some(frame) = conn.outbound.next().await {
            if let OutboundFrame::Close { code, .. } = frame {
                assert_eq!(code, close::NORMAL);
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_capacity_boundary() {
        let manager = test_manager();
        for i in 0..4 {
            let conn = Arc::new(Connection::new(format!("c{i}"), 4));
            manager.register(conn).await;
        }
        assert!(!manager.has_capacity().await);
    }
}
