use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    tokio::sync::mpsc::{self, error::TrySendError},
    tracing::{debug, info, warn},
};

use switchyard_protocol::Envelope;

use crate::bridge::BridgeMailbox;

// ── Connection handle ────────────────────────────────────────────────────────

/// Frames queued for a WebSocket connection's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    WebSocket,
    Bridge,
}

/// How the gateway reaches a node. The registry only ever talks to a node
/// through this handle.
#[derive(Debug, Clone)]
pub enum NodeSink {
    /// Bounded queue drained by the connection's writer task.
    WebSocket(mpsc::Sender<Outbound>),
    Bridge(Arc<BridgeMailbox>),
}

/// Queue `out` without waiting. A full queue means the peer stopped reading;
/// the frame is dropped.
fn try_queue(tx: &mpsc::Sender<Outbound>, out: Outbound) -> bool {
    match tx.try_send(out) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(capacity = tx.max_capacity(), "ws: outbound queue full, dropping frame");
            false
        },
        Err(TrySendError::Closed(_)) => false,
    }
}

impl NodeSink {
    pub fn transport(&self) -> Transport {
        match self {
            Self::WebSocket(_) => Transport::WebSocket,
            Self::Bridge(_) => Transport::Bridge,
        }
    }

    /// Best-effort delivery. Returns false if the connection is gone.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        match self {
            Self::WebSocket(tx) => try_queue(tx, Outbound::Frame(envelope.to_json())),
            Self::Bridge(mailbox) => mailbox.push(envelope.clone()),
        }
    }

    /// Release transport resources once the node leaves the registry.
    pub fn close(&self) {
        if let Self::Bridge(mailbox) = self {
            mailbox.close();
        }
    }

    /// Drop the underlying connection. WebSocket peers get a close frame.
    pub fn disconnect(&self, code: u16, reason: &str) {
        match self {
            Self::WebSocket(tx) => {
                try_queue(tx, Outbound::Close {
                    code,
                    reason: reason.to_string(),
                });
            },
            Self::Bridge(mailbox) => mailbox.close(),
        }
    }

    pub fn mailbox(&self) -> Option<&Arc<BridgeMailbox>> {
        match self {
            Self::Bridge(mailbox) => Some(mailbox),
            Self::WebSocket(_) => None,
        }
    }
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// Fixed-window message counter.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: Instant,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }
}

/// A registered client connection.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub session_id: Option<String>,
    pub agent_name: Option<String>,
    /// Groups this node belongs to, mirrored from the group manager.
    pub groups: BTreeSet<String>,
    pub rate: RateWindow,
    pub last_pong_at: Instant,
    pub sink: NodeSink,
}

impl Node {
    pub fn transport(&self) -> Transport {
        self.sink.transport()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_nodes: usize,
    /// Nodes carrying a non-empty session id.
    pub active_sessions: usize,
    pub session_ids: Vec<String>,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Authoritative table of connected nodes.
pub struct NodeRegistry {
    /// node_id → Node
    nodes: HashMap<String, Node>,
    max_nodes: usize,
    max_messages: u32,
    window: Duration,
}

impl NodeRegistry {
    pub fn new(max_nodes: usize, max_messages: u32, window: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            max_nodes,
            max_messages,
            window,
        }
    }

    /// Admit a node. `None` means the registry is at capacity.
    pub fn register_node(
        &mut self,
        sink: NodeSink,
        name: &str,
        capabilities: Vec<String>,
        session_id: Option<String>,
        agent_name: Option<String>,
    ) -> Option<&Node> {
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let now = Instant::now();
        let id = uuid::Uuid::new_v4().to_string();
        let node = Node {
            id: id.clone(),
            name: name.to_string(),
            capabilities: capabilities.into_iter().collect(),
            session_id: session_id.filter(|s| !s.is_empty()),
            agent_name,
            groups: BTreeSet::new(),
            rate: RateWindow::new(now),
            last_pong_at: now,
            sink,
        };
        info!(
            node_id = %id,
            name = %node.name,
            transport = ?node.transport(),
            "node registered"
        );
        self.nodes.insert(id.clone(), node);
        self.nodes.get(&id)
    }

    /// Remove a node and release its transport. Idempotent. The caller must
    /// already have detached the node from every group.
    pub fn unregister_node(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        node.sink.close();
        info!(node_id = %id, name = %node.name, "node unregistered");
        Some(node)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn list(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    // ── Rate limiting ────────────────────────────────────────────────────

    pub fn is_rate_limited(&self, id: &str) -> bool {
        self.is_rate_limited_at(id, Instant::now())
    }

    pub fn is_rate_limited_at(&self, id: &str, now: Instant) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        now.saturating_duration_since(node.rate.window_start) < self.window
            && node.rate.count >= self.max_messages
    }

    pub fn record_message(&mut self, id: &str) {
        self.record_message_at(id, Instant::now());
    }

    pub fn record_message_at(&mut self, id: &str, now: Instant) {
        let window = self.window;
        if let Some(node) = self.nodes.get_mut(id) {
            if now.saturating_duration_since(node.rate.window_start) >= window {
                node.rate = RateWindow::new(now);
            }
            node.rate.count = node.rate.count.saturating_add(1);
        }
    }

    /// Check and count one message under a single borrow. Returns false if
    /// the message must be dropped.
    pub fn admit_message(&mut self, id: &str) -> bool {
        self.admit_message_at(id, Instant::now())
    }

    pub fn admit_message_at(&mut self, id: &str, now: Instant) -> bool {
        if self.is_rate_limited_at(id, now) {
            return false;
        }
        self.record_message_at(id, now);
        true
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    /// Record proof of life (a `ping` or `pong` from the node).
    pub fn update_ping(&mut self, id: &str) -> bool {
        self.update_ping_at(id, Instant::now())
    }

    pub fn update_ping_at(&mut self, id: &str, now: Instant) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.last_pong_at = now;
                true
            },
            None => false,
        }
    }

    /// Nodes silent for longer than `timeout`.
    pub fn stale_node_ids(&self, timeout: Duration) -> Vec<String> {
        self.stale_node_ids_at(timeout, Instant::now())
    }

    pub fn stale_node_ids_at(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| now.saturating_duration_since(n.last_pong_at) > timeout)
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Group mirror ─────────────────────────────────────────────────────

    pub fn note_joined(&mut self, id: &str, group_id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.groups.insert(group_id.to_string());
        }
    }

    pub fn note_left(&mut self, id: &str, group_id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.groups.remove(group_id);
        }
    }

    // ── Delivery ─────────────────────────────────────────────────────────

    pub fn send_to_node(&self, id: &str, envelope: &Envelope) -> bool {
        match self.nodes.get(id) {
            Some(node) => {
                let ok = node.sink.deliver(envelope);
                if !ok {
                    debug!(node_id = %id, kind = %envelope.kind, "delivery failed, connection gone");
                }
                ok
            },
            None => false,
        }
    }

    /// Deliver to each id; returns how many sends succeeded.
    pub fn broadcast_to_nodes<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
        envelope: &Envelope,
    ) -> usize {
        ids.into_iter()
            .filter(|id| self.send_to_node(id, envelope))
            .count()
    }

    /// Deliver to every registered node.
    pub fn broadcast_all(&self, envelope: &Envelope) -> usize {
        self.nodes
            .values()
            .filter(|n| n.sink.deliver(envelope))
            .count()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let sessions: BTreeSet<&str> = self
            .nodes
            .values()
            .filter_map(|n| n.session_id.as_deref())
            .collect();
        RegistryStats {
            total_nodes: self.nodes.len(),
            active_sessions: self
                .nodes
                .values()
                .filter(|n| n.session_id.is_some())
                .count(),
            session_ids: sessions.into_iter().map(str::to_string).collect(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, switchyard_protocol::MessageType};

    fn registry(max_nodes: usize) -> NodeRegistry {
        NodeRegistry::new(max_nodes, 3, Duration::from_secs(1))
    }

    fn ws_sink() -> (NodeSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (NodeSink::WebSocket(tx), rx)
    }

    fn add(reg: &mut NodeRegistry, name: &str) -> (String, mpsc::Receiver<Outbound>) {
        let (sink, rx) = ws_sink();
        let id = reg
            .register_node(sink, name, vec![], None, None)
            .unwrap()
            .id
            .clone();
        (id, rx)
    }

    #[test]
    fn register_assigns_unique_ids() {
        let mut reg = registry(10);
        let (a, _ra) = add(&mut reg, "alice");
        let (b, _rb) = add(&mut reg, "alice");
        assert_ne!(a, b);
        assert_eq!(reg.count(), 2);
        assert_eq!(reg.get(&a).unwrap().name, "alice");
        assert_eq!(reg.get(&a).unwrap().rate.count, 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = registry(1);
        let (_a, _ra) = add(&mut reg, "alice");
        let (sink, _rx) = ws_sink();
        assert!(reg.register_node(sink, "bob", vec![], None, None).is_none());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut reg = registry(2);
        let (a, _ra) = add(&mut reg, "alice");
        assert!(reg.unregister_node(&a).is_some());
        assert!(reg.unregister_node(&a).is_none());
        assert!(!reg.contains(&a));
        // A freed slot can be reused.
        let (_b, _rb) = add(&mut reg, "bob");
        let (_c, _rc) = add(&mut reg, "carol");
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn fixed_window_rate_limit() {
        let mut reg = registry(1);
        let (a, _ra) = add(&mut reg, "alice");
        let t0 = reg.get(&a).unwrap().rate.window_start;

        for _ in 0..3 {
            assert!(reg.admit_message_at(&a, t0));
        }
        assert!(reg.is_rate_limited_at(&a, t0 + Duration::from_millis(500)));
        assert!(!reg.admit_message_at(&a, t0 + Duration::from_millis(999)));
        // Rejected messages are not counted.
        assert_eq!(reg.get(&a).unwrap().rate.count, 3);

        // Window rolls over.
        let t1 = t0 + Duration::from_secs(1);
        assert!(!reg.is_rate_limited_at(&a, t1));
        assert!(reg.admit_message_at(&a, t1));
        assert_eq!(reg.get(&a).unwrap().rate.count, 1);
    }

    #[test]
    fn unknown_nodes_are_never_rate_limited() {
        let reg = registry(1);
        assert!(!reg.is_rate_limited("ghost"));
    }

    #[test]
    fn stale_detection_uses_last_pong() {
        let mut reg = registry(3);
        let (a, _ra) = add(&mut reg, "alice");
        let (b, _rb) = add(&mut reg, "bob");
        let start = reg.get(&a).unwrap().last_pong_at;
        let timeout = Duration::from_secs(60);

        assert!(reg.update_ping_at(&b, start + Duration::from_secs(50)));
        let later = start + Duration::from_secs(61);
        assert_eq!(reg.stale_node_ids_at(timeout, later), vec![a.clone()]);
        // Exactly at the timeout is not yet stale.
        assert!(
            reg.stale_node_ids_at(timeout, start + Duration::from_secs(60))
                .is_empty()
        );
        assert!(!reg.update_ping("ghost"));
    }

    #[test]
    fn delivery_counts_only_successful_sends() {
        let mut reg = registry(3);
        let (a, mut ra) = add(&mut reg, "alice");
        let (b, rb) = add(&mut reg, "bob");
        drop(rb);

        let ping = Envelope::ping();
        let n = reg.broadcast_to_nodes([&a, &b, &"ghost".to_string()], &ping);
        assert_eq!(n, 1);
        let Ok(Outbound::Frame(frame)) = ra.try_recv() else {
            panic!("expected a frame");
        };
        let env: Envelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(env.kind, MessageType::Ping);

        assert!(!reg.send_to_node(&b, &ping));
        assert_eq!(reg.broadcast_all(&ping), 1);
    }

    #[test]
    fn full_websocket_queue_drops_frames() {
        let (tx, mut rx) = mpsc::channel(2);
        let sink = NodeSink::WebSocket(tx);
        let ping = Envelope::new(MessageType::Ping);
        assert!(sink.deliver(&ping));
        assert!(sink.deliver(&ping));
        assert!(!sink.deliver(&ping));

        rx.try_recv().unwrap();
        assert!(sink.deliver(&ping));
        assert_eq!(rx.len(), 2);

        drop(rx);
        assert!(!sink.deliver(&ping));
    }

    #[test]
    fn stats_count_sessions() {
        let mut reg = registry(5);
        let (s1, _r1) = ws_sink();
        let (s2, _r2) = ws_sink();
        let (s3, _r3) = ws_sink();
        let (s4, _r4) = ws_sink();
        reg.register_node(s1, "a", vec![], Some("sess-1".into()), None);
        reg.register_node(s2, "b", vec![], Some("sess-1".into()), Some("coder".into()));
        reg.register_node(s3, "c", vec![], Some(String::new()), None);
        reg.register_node(s4, "d", vec!["x".into()], None, None);

        let stats = reg.get_stats();
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.session_ids, vec!["sess-1".to_string()]);
    }

    #[test]
    fn group_mirror() {
        let mut reg = registry(1);
        let (a, _ra) = add(&mut reg, "alice");
        reg.note_joined(&a, "g1");
        reg.note_joined(&a, "g2");
        reg.note_left(&a, "g1");
        let groups: Vec<_> = reg.get(&a).unwrap().groups.iter().cloned().collect();
        assert_eq!(groups, vec!["g2".to_string()]);
    }
}
