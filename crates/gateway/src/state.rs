use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    tokio::sync::RwLock,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use {
    switchyard_config::GatewayConfig,
    switchyard_discovery::{Announcement, TRANSPORT_BRIDGE, TRANSPORT_WEBSOCKET},
};

use crate::{
    auth::AuthGuard,
    groups::{GroupManager, GroupStats},
    nodes::{Node, NodeRegistry, RegistryStats},
};

/// WebSocket close code sent to nodes evicted for silence (going away).
pub const CLOSE_EVICTED: u16 = 1001;

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub uptime_ms: u64,
    pub require_auth: bool,
    pub max_nodes: usize,
    pub capabilities: Vec<String>,
    pub transport: String,
    pub transports: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub gateway: GatewayInfo,
    pub nodes: RegistryStats,
    pub groups: GroupStats,
}

/// Every gateway serves `/ws` and the `/bridge` long-poll fallback.
fn served_transports() -> Vec<String> {
    vec![TRANSPORT_WEBSOCKET.into(), TRANSPORT_BRIDGE.into()]
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
///
/// Lock order: `nodes` before `groups`. Neither lock is held across a
/// socket write.
pub struct GatewayState {
    pub config: GatewayConfig,
    /// Server version string.
    pub version: String,
    pub hostname: String,
    /// Name advertised through discovery and `/stats`.
    pub name: String,
    pub started_at: Instant,
    pub auth: AuthGuard,
    pub nodes: RwLock<NodeRegistry>,
    pub groups: RwLock<GroupManager>,
    /// Cancelled once when the gateway stops.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let hostname = switchyard_discovery::local_hostname();
        let name = config
            .discovery
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("switchyard@{hostname}"));

        Arc::new(Self {
            auth: AuthGuard::from_config(&config),
            nodes: RwLock::new(NodeRegistry::new(
                config.max_nodes,
                config.rate_limit.max_messages,
                Duration::from_millis(config.rate_limit.window_ms),
            )),
            groups: RwLock::new(GroupManager::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            name,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Detach a node from every group, then drop it from the registry.
    /// Idempotent.
    pub async fn remove_node(&self, node_id: &str) -> Option<Node> {
        let mut nodes = self.nodes.write().await;
        let mut groups = self.groups.write().await;
        let left = groups.remove_node_from_all_groups(node_id);
        if !left.is_empty() {
            debug!(node_id = %node_id, groups = left.len(), "node left all groups");
        }
        nodes.unregister_node(node_id)
    }

    /// Evict nodes silent for longer than `timeout` and drop their
    /// connections. Returns how many were evicted.
    pub async fn remove_stale_nodes(&self, timeout: Duration) -> usize {
        self.remove_stale_nodes_at(timeout, Instant::now()).await
    }

    pub async fn remove_stale_nodes_at(&self, timeout: Duration, now: Instant) -> usize {
        let mut nodes = self.nodes.write().await;
        let stale = nodes.stale_node_ids_at(timeout, now);
        if stale.is_empty() {
            return 0;
        }
        let mut groups = self.groups.write().await;
        for id in &stale {
            groups.remove_node_from_all_groups(id);
            if let Some(node) = nodes.unregister_node(id) {
                info!(node_id = %id, name = %node.name, "evicted stale node");
                node.sink.disconnect(CLOSE_EVICTED, "heartbeat timeout");
            }
        }
        stale.len()
    }

    pub async fn stats(&self) -> GatewayStats {
        let nodes = self.nodes.read().await;
        let groups = self.groups.read().await;
        GatewayStats {
            gateway: GatewayInfo {
                name: self.name.clone(),
                version: self.version.clone(),
                hostname: self.hostname.clone(),
                uptime_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                require_auth: self.auth.require_auth(),
                max_nodes: nodes.max_nodes(),
                capabilities: self.config.capabilities.clone(),
                transport: TRANSPORT_WEBSOCKET.into(),
                transports: served_transports(),
            },
            nodes: nodes.get_stats(),
            groups: groups.get_stats(),
        }
    }

    pub async fn health(&self) -> serde_json::Value {
        let nodes = self.nodes.read().await.get_stats();
        let groups = self.groups.read().await.get_stats();
        serde_json::json!({
            "status": "ok",
            "version": self.version,
            "stats": { "nodes": nodes, "groups": groups },
            "timestamp": switchyard_protocol::now_ms(),
        })
    }

    /// What discovery advertises for a gateway listening on `port`.
    pub fn announcement(&self, port: u16) -> Announcement {
        Announcement {
            name: self.name.clone(),
            host: self.config.host.clone(),
            port,
            require_auth: self.auth.require_auth(),
            capabilities: self.config.capabilities.clone(),
            version: self.version.clone(),
            transport: TRANSPORT_WEBSOCKET.into(),
            transports: served_transports(),
        }
    }

    /// Release every pending bridge poll. Used on shutdown.
    pub async fn close_bridge_mailboxes(&self) -> usize {
        let nodes = self.nodes.read().await;
        nodes
            .list()
            .into_iter()
            .filter_map(|n| n.sink.mailbox())
            .map(|mailbox| mailbox.close())
            .count()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::nodes::{NodeSink, Outbound},
        tokio::sync::mpsc,
    };

    fn config() -> GatewayConfig {
        GatewayConfig {
            max_nodes: 4,
            capabilities: vec!["broadcast".into()],
            ..Default::default()
        }
    }

    async fn add(state: &GatewayState, name: &str) -> (String, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let id = state
            .nodes
            .write()
            .await
            .register_node(NodeSink::WebSocket(tx), name, vec![], None, None)
            .unwrap()
            .id
            .clone();
        (id, rx)
    }

    #[tokio::test]
    async fn remove_node_detaches_groups() {
        let state = GatewayState::new(config());
        let (a, _ra) = add(&state, "alice").await;
        let gid = {
            let mut groups = state.groups.write().await;
            groups.get_or_create_group("g", &a, None).0.id.clone()
        };
        assert!(state.remove_node(&a).await.is_some());
        assert!(state.remove_node(&a).await.is_none());
        assert!(state.groups.read().await.get_group_members(&gid).is_empty());
        assert_eq!(state.nodes.read().await.count(), 0);
    }

    #[tokio::test]
    async fn stale_nodes_are_evicted_and_disconnected() {
        let state = GatewayState::new(config());
        let (a, mut ra) = add(&state, "alice").await;
        let (b, _rb) = add(&state, "bob").await;
        let start = state.nodes.read().await.get(&a).unwrap().last_pong_at;
        state
            .nodes
            .write()
            .await
            .update_ping_at(&b, start + Duration::from_secs(100));

        let evicted = state
            .remove_stale_nodes_at(Duration::from_secs(60), start + Duration::from_secs(120))
            .await;
        assert_eq!(evicted, 1);
        assert!(!state.nodes.read().await.contains(&a));
        assert!(state.nodes.read().await.contains(&b));
        assert!(matches!(
            ra.try_recv(),
            Ok(Outbound::Close {
                code: CLOSE_EVICTED,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stats_shape() {
        let state = GatewayState::new(config());
        let (_a, _ra) = add(&state, "alice").await;
        let stats = serde_json::to_value(state.stats().await).unwrap();
        assert_eq!(stats["gateway"]["maxNodes"], 4);
        assert_eq!(stats["gateway"]["requireAuth"], false);
        assert_eq!(stats["gateway"]["capabilities"][0], "broadcast");
        assert_eq!(stats["gateway"]["transports"][1], "http-bridge");
        assert_eq!(stats["nodes"]["totalNodes"], 1);
        assert_eq!(stats["groups"]["totalGroups"], 0);

        let health = state.health().await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["stats"]["nodes"]["totalNodes"], 1);
    }

    #[test]
    fn default_name_uses_hostname() {
        let state = GatewayState::new(GatewayConfig::default());
        assert!(state.name.starts_with("switchyard@"));
        let ann = state.announcement(9000);
        assert_eq!(ann.port, 9000);
        assert_eq!(ann.transport, "websocket");
        assert_eq!(ann.transports, vec!["websocket", "http-bridge"]);
    }
}
