//! Gateway discovery: advertise a running gateway and find reachable ones.
//!
//! Two interchangeable backends sit behind the [`Discovery`] trait:
//! - [`mdns::MdnsDiscovery`] on the local network segment
//! - [`tailscale::TailscaleDiscovery`] across a tailnet, limited to tagged peers
//!
//! Discovery is informational only and never touches gateway state.

pub mod error;
pub mod mdns;
pub mod tailscale;

use std::time::Duration;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

pub use {
    error::{DiscoveryError, Result},
    switchyard_config::DiscoveryMethod,
};

/// Primary transport: the `/ws` endpoint.
pub const TRANSPORT_WEBSOCKET: &str = "websocket";
/// HTTP long-poll fallback under `/bridge`.
pub const TRANSPORT_BRIDGE: &str = "http-bridge";

/// What a gateway advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub require_auth: bool,
    pub capabilities: Vec<String>,
    pub version: String,
    /// Preferred transport.
    pub transport: String,
    /// Every transport the gateway serves, preferred first.
    pub transports: Vec<String>,
}

/// A remote gateway found by a discovery query. Lives only as long as the
/// query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub name: String,
    pub url: String,
    pub host: String,
    pub port: u16,
    pub transport: String,
    pub transports: Vec<String>,
    pub require_auth: bool,
    pub capabilities: Vec<String>,
    pub version: String,
}

impl DiscoveryRecord {
    /// WebSocket endpoint for a gateway at `host:port`.
    pub fn ws_url(host: &str, port: u16) -> String {
        if host.contains(':') && !host.starts_with('[') {
            format!("ws://[{host}]:{port}/ws")
        } else {
            format!("ws://{host}:{port}/ws")
        }
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    fn method(&self) -> DiscoveryMethod;

    /// Start advertising this gateway. Calling it again replaces the
    /// previous announcement.
    async fn announce(&self, announcement: &Announcement) -> Result<()>;

    /// Withdraw the announcement. A no-op when nothing is announced.
    async fn stop_announcing(&self) -> Result<()>;

    /// Collect gateways until `timeout` elapses. Partial results are normal.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveryRecord>>;
}

/// Build the backend selected by config.
pub fn from_method(method: DiscoveryMethod, tailscale_tag: &str, port: u16) -> Box<dyn Discovery> {
    match method {
        DiscoveryMethod::Mdns => Box::new(mdns::MdnsDiscovery::new()),
        DiscoveryMethod::Tailscale => {
            Box::new(tailscale::TailscaleDiscovery::new(tailscale_tag, port))
        },
    }
}

/// Split a comma-joined TXT value, dropping blanks.
pub(crate) fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Local hostname, or `"switchyard"` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "switchyard".into())
}
