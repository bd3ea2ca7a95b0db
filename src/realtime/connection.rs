//! Per-connection state: identity, health counters, subscription registry,
//! and the bounded outbound queue.
//!
//! The reader task is the sole mutator of subscription state; the writer
//! task only drains the outbound queue. Everything here is lock-light:
//! atomics for counters, short `parking_lot` sections for the rest, never
//! held across an await.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use crate::events::{Event, EventFilter, EventType};
use crate::metrics;
use crate::session::TokenClaims;

/// A frame waiting for the writer task. Control frames (heartbeat probes,
/// close, administrative confirmations) are never dropped by backpressure.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text { text: String, control: bool },
    Close { code: u16, reason: &'static str },
}

impl OutboundFrame {
    fn is_control(&self) -> bool {
        match self {
            OutboundFrame::Text { control, .. } => *control,
            OutboundFrame::Close { .. } => true,
        }
    }
}

/// Bounded FIFO between fan-out and the connection's writer task. Overflow
/// evicts the oldest non-control frame and counts the drop.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame; returns false once the queue has been closed.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                let victim = frames.iter().position(|f| !f.is_control());
                match victim {
                    Some(index) => {
                        frames.remove(index);
                    }
                    None => {
                        frames.pop_front();
                    }
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::FRAMES_DROPPED.inc();
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next frame; `None` means the queue was closed and drained.
    pub async fn next(&self) -> Option<OutboundFrame> {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Health grade derived from heartbeat accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Healthy,
    Inactive,
    Degraded,
    Unhealthy,
    Stale,
}

/// Snapshot used by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub authenticated: bool,
    pub uptime: f64,
    pub ping_count: u64,
    pub pong_count: u64,
    pub missed_pongs: u32,
    pub subscriptions: Vec<EventType>,
    pub agent_subscriptions: Vec<String>,
    pub outbound_len: usize,
    pub outbound_dropped: u64,
    pub health: ConnectionHealth,
}

pub struct Connection {
    pub connection_id: String,
    pub connected_at: Instant,
    authenticated: AtomicBool,
    user_id: RwLock<Option<String>>,
    roles: RwLock<Vec<String>>,
    last_recv: RwLock<Instant>,
    last_pong: RwLock<Instant>,
    ping_seq: AtomicU64,
    pong_count: AtomicU64,
    missed_pongs: AtomicU32,
    subs: RwLock<HashSet<EventType>>,
    filter: RwLock<EventFilter>,
    agent_scope: RwLock<HashSet<String>>,
    pub outbound: OutboundQueue,
}

impl Connection {
    pub fn new(connection_id: impl Into<String>, outbound_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            connection_id: connection_id.into(),
            connected_at: now,
            authenticated: AtomicBool::new(false),
            user_id: RwLock::new(None),
            roles: RwLock::new(Vec::new()),
            last_recv: RwLock::new(now),
            last_pong: RwLock::new(now),
            ping_seq: AtomicU64::new(0),
            pong_count: AtomicU64::new(0),
            missed_pongs: AtomicU32::new(0),
            subs: RwLock::new(HashSet::new()),
            filter: RwLock::new(EventFilter::default()),
            agent_scope: RwLock::new(HashSet::new()),
            outbound: OutboundQueue::new(outbound_capacity),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn mark_authenticated(&self, claims: &TokenClaims) {
        *self.user_id.write() = Some(claims.user_id.clone());
        *self.roles.write() = claims.roles.clone();
        self.authenticated.store(true, Ordering::Release);
    }

    /// Anonymous authentication used when `auth_required` is off.
    pub fn mark_anonymous(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    pub fn is_admin(&self) -> bool {
        self.roles.read().iter().any(|r| r == "admin")
    }

    pub fn touch_recv(&self) {
        *self.last_recv.write() = Instant::now();
    }

    pub fn idle_for(&self) -> f64 {
        self.last_recv.read().elapsed().as_secs_f64()
    }

    pub fn record_pong(&self) {
        *self.last_pong.write() = Instant::now();
        self.pong_count.fetch_add(1, Ordering::Relaxed);
        if self.missed_pongs.swap(0, Ordering::Relaxed) > 0 {
            tracing::info!(
                connection_id = %self.connection_id,
                "connection recovered, missed pong counter reset"
            );
        }
    }

    pub fn pong_silence(&self) -> f64 {
        self.last_pong.read().elapsed().as_secs_f64()
    }

    /// Allocate the next monotonically increasing ping sequence number.
    pub fn next_ping_seq(&self) -> u64 {
        self.ping_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ping_count(&self) -> u64 {
        self.ping_seq.load(Ordering::Relaxed)
    }

    pub fn note_missed_pong(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, event_type: EventType) {
        self.subs.write().insert(event_type);
    }

    pub fn unsubscribe(&self, event_type: EventType) {
        self.subs.write().remove(&event_type);
    }

    pub fn is_subscribed(&self, event_type: EventType) -> bool {
        self.subs.read().contains(&event_type)
    }

    pub fn subscriptions(&self) -> HashSet<EventType> {
        self.subs.read().clone()
    }

    pub fn restore_subscriptions(&self, subs: HashSet<EventType>) {
        *self.subs.write() = subs;
    }

    pub fn set_filter(&self, filter: EventFilter) {
        *self.filter.write() = filter;
    }

    pub fn filter(&self) -> EventFilter {
        self.filter.read().clone()
    }

    pub fn filter_matches(&self, event: &Event) -> bool {
        self.filter.read().matches(event)
    }

    pub fn subscribe_agent(&self, agent_id: impl Into<String>) {
        self.agent_scope.write().insert(agent_id.into());
    }

    pub fn unsubscribe_agent(&self, agent_id: &str) {
        self.agent_scope.write().remove(agent_id);
    }

    pub fn agent_scope(&self) -> HashSet<String> {
        self.agent_scope.read().clone()
    }

    pub fn restore_agent_scope(&self, scope: HashSet<String>) {
        *self.agent_scope.write() = scope;
    }

    /// Serialize and enqueue an event frame.
    pub fn send_event(&self, event: &Event) -> bool {
        self.send_event_raw(event, false)
    }

    /// Administrative/heartbeat frames that must survive backpressure.
    pub fn send_control_event(&self, event: &Event) -> bool {
        self.send_event_raw(event, true)
    }

    fn send_event_raw(&self, event: &Event, control: bool) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.outbound.push(OutboundFrame::Text { text, control }),
            Err(err) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    "failed to encode outbound event: {}",
                    err
                );
                false
            }
        }
    }

    /// Enqueue a pre-serialized frame (fan-out serializes once per event).
    pub fn send_serialized(&self, text: String) -> bool {
        self.outbound.push(OutboundFrame::Text {
            text,
            control: false,
        })
    }

    pub fn send_close(&self, code: u16, reason: &'static str) {
        self.outbound.push(OutboundFrame::Close { code, reason });
        self.outbound.close();
    }

    pub fn health(&self, heartbeat_interval: f64, connection_timeout: f64) -> ConnectionHealth {
        if self.idle_for() > connection_timeout * 2.0 {
            return ConnectionHealth::Stale;
        }
        let missed = self.missed_pongs();
        if missed > 3 {
            return ConnectionHealth::Unhealthy;
        }
        if missed > 1 {
            return ConnectionHealth::Degraded;
        }
        if self.pong_silence() > heartbeat_interval * 2.0 {
            return ConnectionHealth::Inactive;
        }
        ConnectionHealth::Healthy
    }

    pub fn snapshot(&self, heartbeat_interval: f64, connection_timeout: f64) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id(),
            authenticated: self.is_authenticated(),
            uptime: self.connected_at.elapsed().as_secs_f64(),
            ping_count: self.ping_count(),
            pong_count: self.pong_count.load(Ordering::Relaxed),
            missed_pongs: self.missed_pongs(),
            subscriptions: self.subs.read().iter().copied().collect(),
            agent_subscriptions: self.agent_scope.read().iter().cloned().collect(),
            outbound_len: self.outbound.len(),
            outbound_dropped: self.outbound.dropped(),
            health: self.health(heartbeat_interval, connection_timeout),
        }
    }
}

/// Subscription state preserved across a disconnect for later recovery.
#[derive(Debug, Clone)]
pub struct RecoverySnapshot {
    pub subscriptions: HashSet<EventType>,
    pub filter: EventFilter,
    pub agent_scope: HashSet<String>,
    pub disconnected_at: Instant,
}

impl RecoverySnapshot {
    pub fn age(&self) -> f64 {
        self.disconnected_at.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frame(text: &str, control: bool) -> OutboundFrame {
        OutboundFrame::Text {
            text: text.to_string(),
            control,
        }
    }

    #[tokio::test]
    async fn test_queue_orders_fifo() {
        let queue = OutboundQueue::new(8);
        queue.push(text_frame("a", false));
        queue.push(text_frame("b", false));

        match queue.next().await {
            Some(OutboundFrame::Text { text, .. }) => assert_eq!(text, "a"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match queue.next().await {
            Some(OutboundFrame::Text { text, .. }) => assert_eq!(text, "b"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest_non_control() {
        let queue = OutboundQueue::new(2);
        queue.push(text_frame("control", true));
        queue.push(text_frame("old", false));
        queue.push(text_frame("new", false));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        // Control frame survives; "old" was the victim.
        match queue.next().await {
            Some(OutboundFrame::Text { text, .. }) => assert_eq!(text, "control"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match queue.next().await {
            Some(OutboundFrame::Text { text, .. }) => assert_eq!(text, "new"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_returns_none() {
        let queue = OutboundQueue::new(2);
        queue.push(text_frame("x", false));
        queue.close();

        assert!(!queue.push(text_frame("y", false)));
        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        let conn = Connection::new("c1", 8);
        let baseline = conn.subscriptions();
        conn.subscribe(EventType::WorkflowProgress);
        conn.unsubscribe(EventType::WorkflowProgress);
        assert_eq!(conn.subscriptions(), baseline);
    }

    #[test]
    fn test_pong_resets_missed_counter() {
        let conn = Connection::new("c1", 8);
        conn.note_missed_pong();
        conn.note_missed_pong();
        assert_eq!(conn.missed_pongs(), 2);
        conn.record_pong();
        assert_eq!(conn.missed_pongs(), 0);
    }

    #[test]
    fn test_health_grades() {
        let conn = Connection::new("c1", 8);
        assert_eq!(conn.health(30.0, 60.0), ConnectionHealth::Healthy);

        for _ in 0..2 {
            conn.note_missed_pong();
        }
        assert_eq!(conn.health(30.0, 60.0), ConnectionHealth::Degraded);

        for _ in 0..2 {
            conn.note_missed_pong();
        }
        assert_eq!(conn.health(30.0, 60.0), ConnectionHealth::Unhealthy);
    }

    #[test]
    fn test_ping_seq_is_monotonic() {
        let conn = Connection::new("c1", 8);
        let a = conn.next_ping_seq();
        let b = conn.next_ping_seq();
        assert!(b > a);
    }
}
