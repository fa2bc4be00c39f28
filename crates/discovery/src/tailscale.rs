//! Tailnet discovery via the local `tailscale` CLI.
//!
//! Tailscale has no service advertisement, so "announcing" means the operator
//! tagged this machine with the gateway tag in the tailnet ACLs. Discovery
//! lists online peers carrying that tag and probes their `/stats` endpoint.

use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    serde::Deserialize,
    tokio::process::Command,
    tracing::{debug, info, warn},
};

use crate::{
    Announcement, Discovery, DiscoveryError, DiscoveryMethod, DiscoveryRecord, Result,
    TRANSPORT_WEBSOCKET,
};

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "Self")]
    self_node: Option<PeerJson>,
    #[serde(rename = "Peer", default)]
    peers: HashMap<String, PeerJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PeerJson {
    #[serde(default)]
    host_name: String,
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    online: bool,
}

impl PeerJson {
    fn has_tag(&self, tag: &str) -> bool {
        self.tags.as_ref().is_some_and(|t| t.iter().any(|x| x == tag))
    }
}

/// A tailnet peer that claims to run a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedPeer {
    pub host_name: String,
    pub dns_name: String,
    /// First IPv4 tailnet address, else the first address of any family.
    pub address: String,
}

/// Parsed `tailscale status --json`.
#[derive(Debug)]
pub struct TailnetStatus {
    pub self_tagged: bool,
    pub peers: Vec<TaggedPeer>,
}

/// Extract the online peers tagged `tag`, sorted by host name.
pub fn parse_status(json: &str, tag: &str) -> Result<TailnetStatus> {
    let status: StatusJson = serde_json::from_str(json)?;
    let self_tagged = status.self_node.as_ref().is_some_and(|s| s.has_tag(tag));

    let mut peers: Vec<TaggedPeer> = status
        .peers
        .into_values()
        .filter(|p| p.online && p.has_tag(tag))
        .filter_map(|p| {
            let address = p
                .tailscale_ips
                .iter()
                .find(|ip| !ip.contains(':'))
                .or_else(|| p.tailscale_ips.first())?
                .clone();
            Some(TaggedPeer {
                host_name: p.host_name,
                dns_name: p.dns_name.trim_end_matches('.').to_string(),
                address,
            })
        })
        .collect();
    peers.sort_by(|a, b| a.host_name.cmp(&b.host_name));

    Ok(TailnetStatus { self_tagged, peers })
}

/// Build a record from a peer's `/stats` response.
pub fn record_from_stats(peer: &TaggedPeer, port: u16, stats: &serde_json::Value) -> DiscoveryRecord {
    let gw = &stats["gateway"];
    let str_field = |key: &str| gw[key].as_str().map(str::to_string);
    let strings = |key: &str| -> Vec<String> {
        gw[key]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let transport = str_field("transport").unwrap_or_else(|| TRANSPORT_WEBSOCKET.into());
    let mut transports = strings("transports");
    if transports.is_empty() {
        transports.push(transport.clone());
    }
    DiscoveryRecord {
        name: str_field("name").unwrap_or_else(|| peer.host_name.clone()),
        url: DiscoveryRecord::ws_url(&peer.address, port),
        host: peer.address.clone(),
        port,
        transport,
        transports,
        require_auth: gw["requireAuth"].as_bool().unwrap_or(false),
        capabilities: strings("capabilities"),
        version: str_field("version").unwrap_or_default(),
    }
}

pub struct TailscaleDiscovery {
    tag: String,
    /// Port probed on each peer.
    port: u16,
    binary: String,
    client: reqwest::Client,
}

impl TailscaleDiscovery {
    pub fn new(tag: &str, port: u16) -> Self {
        Self {
            tag: tag.to_string(),
            port,
            binary: "tailscale".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Use a different `tailscale` executable (e.g. the macOS app bundle).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn status(&self) -> Result<TailnetStatus> {
        let output = Command::new(&self.binary)
            .args(["status", "--json"])
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DiscoveryError::Command {
                command: format!("{} status --json", self.binary),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_status(&String::from_utf8_lossy(&output.stdout), &self.tag)
    }

    async fn probe(&self, peer: &TaggedPeer) -> Option<DiscoveryRecord> {
        let url = format!("http://{}:{}/stats", peer.address, self.port);
        let resp = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url = %url, status = %r.status(), "tailscale: probe rejected");
                return None;
            },
            Err(e) => {
                debug!(url = %url, error = %e, "tailscale: probe failed");
                return None;
            },
        };
        let stats: serde_json::Value = resp.json().await.ok()?;
        Some(record_from_stats(peer, self.port, &stats))
    }
}

#[async_trait]
impl Discovery for TailscaleDiscovery {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Tailscale
    }

    async fn announce(&self, announcement: &Announcement) -> Result<()> {
        let status = self.status().await?;
        if status.self_tagged {
            info!(tag = %self.tag, port = announcement.port, "tailscale: gateway visible to tagged discovery");
        } else {
            warn!(
                tag = %self.tag,
                "tailscale: this node lacks the gateway tag; peers will not discover it"
            );
        }
        Ok(())
    }

    /// Nothing to withdraw: visibility follows the tailnet ACL tag.
    async fn stop_announcing(&self) -> Result<()> {
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveryRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let status = match tokio::time::timeout_at(deadline, self.status()).await {
            Ok(status) => status?,
            Err(_) => return Ok(Vec::new()),
        };

        let probes = status.peers.iter().map(|peer| async move {
            tokio::time::timeout_at(deadline, self.probe(peer))
                .await
                .ok()
                .flatten()
        });
        let records: Vec<DiscoveryRecord> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();
        debug!(
            tagged = status.peers.len(),
            reachable = records.len(),
            "tailscale: discovery finished"
        );
        Ok(records)
    }
}
