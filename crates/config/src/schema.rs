use serde::{Deserialize, Serialize};

use switchyard_protocol::{
    BRIDGE_POLL_TIMEOUT_MS, DEFAULT_MAX_NODES, PING_INTERVAL_MS, PING_TIMEOUT_MS,
};

/// Root gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// When true, `register` must carry a token from the accepted set.
    pub require_auth: bool,
    /// Primary shared-secret token.
    pub auth_token: Option<String>,
    /// Additional accepted tokens (e.g. during rotation).
    pub auth_tokens: Vec<String>,

    pub max_nodes: usize,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub log_level: String,
    /// Frames buffered per WebSocket connection before new ones are dropped.
    pub ws_outbound_capacity: usize,

    /// Capabilities this gateway advertises through discovery and `/stats`.
    pub capabilities: Vec<String>,

    pub rate_limit: RateLimitConfig,
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
            require_auth: false,
            auth_token: None,
            auth_tokens: Vec::new(),
            max_nodes: DEFAULT_MAX_NODES,
            ping_interval_ms: PING_INTERVAL_MS,
            ping_timeout_ms: PING_TIMEOUT_MS,
            log_level: "info".into(),
            ws_outbound_capacity: 1000,
            capabilities: vec!["broadcast".into(), "direct".into(), "bridge".into()],
            rate_limit: RateLimitConfig::default(),
            bridge: BridgeConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Fixed-window per-node message limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Messages allowed per window before `RATE_LIMITED`.
    pub max_messages: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            window_ms: 1000,
        }
    }
}

/// HTTP long-poll bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub poll_timeout_ms: u64,
    /// Per-node queue bound; the oldest message is dropped on overflow.
    pub mailbox_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: BRIDGE_POLL_TIMEOUT_MS,
            mailbox_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    #[default]
    Mdns,
    Tailscale,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Mdns => "mdns",
            Self::Tailscale => "tailscale",
        })
    }
}

impl std::str::FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mdns" => Ok(Self::Mdns),
            "tailscale" => Ok(Self::Tailscale),
            other => Err(format!("unknown discovery method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub method: DiscoveryMethod,
    /// Advertised instance name; defaults to the hostname.
    pub name: Option<String>,
    /// Tailscale ACL tag that marks gateway peers.
    pub tailscale_tag: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: DiscoveryMethod::Mdns,
            name: None,
            tailscale_tag: "tag:switchyard-gateway".into(),
        }
    }
}

impl GatewayConfig {
    /// Every token accepted by the auth guard, deduplicated, empty ones dropped.
    pub fn token_set(&self) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        for t in self.auth_token.iter().chain(self.auth_tokens.iter()) {
            if !t.is_empty() && !tokens.contains(t) {
                tokens.push(t.clone());
            }
        }
        tokens
    }

    /// Apply `SWITCHYARD_TOKEN` / `SWITCHYARD_REQUIRE_AUTH` overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|k| std::env::var(k).ok());
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("SWITCHYARD_TOKEN").filter(|t| !t.is_empty())
            && !self.auth_tokens.contains(&token)
        {
            self.auth_tokens.push(token);
        }
        if let Some(flag) = lookup("SWITCHYARD_REQUIRE_AUTH") {
            self.require_auth = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_nodes == 0 {
            anyhow::bail!("max_nodes must be at least 1");
        }
        if self.ping_interval_ms == 0 || self.ping_timeout_ms == 0 {
            anyhow::bail!("ping_interval_ms and ping_timeout_ms must be non-zero");
        }
        if self.ping_timeout_ms < self.ping_interval_ms {
            anyhow::bail!(
                "ping_timeout_ms ({}) must not be shorter than ping_interval_ms ({})",
                self.ping_timeout_ms,
                self.ping_interval_ms
            );
        }
        if self.rate_limit.max_messages == 0 || self.rate_limit.window_ms == 0 {
            anyhow::bail!("rate_limit.max_messages and rate_limit.window_ms must be non-zero");
        }
        if self.bridge.poll_timeout_ms == 0 || self.bridge.mailbox_capacity == 0 {
            anyhow::bail!("bridge.poll_timeout_ms and bridge.mailbox_capacity must be non-zero");
        }
        if self.ws_outbound_capacity == 0 {
            anyhow::bail!("ws_outbound_capacity must be non-zero");
        }
        if self.require_auth && self.token_set().is_empty() {
            anyhow::bail!("require_auth is set but no auth_token is configured");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
