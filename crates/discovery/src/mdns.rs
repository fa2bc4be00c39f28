use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use {
    async_trait::async_trait,
    mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    Announcement, Discovery, DiscoveryMethod, DiscoveryRecord, Result, TRANSPORT_WEBSOCKET,
    comma_list,
};

/// DNS-SD service type every switchyard gateway registers under.
pub const SERVICE_TYPE: &str = "_switchyard._tcp.local.";

/// mDNS backend. The responder daemon is started lazily on first use and
/// shared between announcing and browsing.
pub struct MdnsDiscovery {
    daemon: Mutex<Option<ServiceDaemon>>,
    /// Full service name of the active announcement.
    registered: Mutex<Option<String>>,
}

impl Default for MdnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MdnsDiscovery {
    pub fn new() -> Self {
        Self {
            daemon: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    async fn daemon(&self) -> Result<ServiceDaemon> {
        let mut guard = self.daemon.lock().await;
        if let Some(d) = guard.as_ref() {
            return Ok(d.clone());
        }
        let d = ServiceDaemon::new()?;
        *guard = Some(d.clone());
        Ok(d)
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Mdns
    }

    async fn announce(&self, announcement: &Announcement) -> Result<()> {
        self.stop_announcing().await?;
        let daemon = self.daemon().await?;

        let instance = instance_name(&announcement.name);
        let host_name = format!("{}.local.", instance_name(&crate::local_hostname()));
        let ip = advertised_ip(&announcement.host);
        let props = txt_properties(announcement);

        let mut service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &host_name,
            ip.as_str(),
            announcement.port,
            props,
        )?;
        if ip.is_empty() {
            service = service.enable_addr_auto();
        }
        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        info!(name = %instance, port = announcement.port, "mdns: announced gateway");
        *self.registered.lock().await = Some(fullname);
        Ok(())
    }

    async fn stop_announcing(&self) -> Result<()> {
        let Some(fullname) = self.registered.lock().await.take() else {
            return Ok(());
        };
        if let Some(daemon) = self.daemon.lock().await.as_ref() {
            daemon.unregister(&fullname)?;
            debug!(service = %fullname, "mdns: withdrew announcement");
        }
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveryRecord>> {
        let daemon = self.daemon().await?;
        let receiver = daemon.browse(SERVICE_TYPE)?;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut found: BTreeMap<String, DiscoveryRecord> = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(resolved))) => {
                    let props: HashMap<String, String> = TXT_KEYS
                        .iter()
                        .filter_map(|k| {
                            resolved
                                .get_property_val_str(k)
                                .map(|v| (k.to_string(), v.to_string()))
                        })
                        .collect();
                    let address = resolved
                        .get_addresses_v4()
                        .into_iter()
                        .map(|ip| ip.to_string())
                        .min();
                    let host =
                        address.unwrap_or_else(|| resolved.host.trim_end_matches('.').to_string());
                    let record = record_from_txt(&host, resolved.port, &props);
                    debug!(service = %resolved.fullname, url = %record.url, "mdns: resolved gateway");
                    found.insert(resolved.fullname.clone(), record);
                },
                Ok(Ok(_)) => {},
                Ok(Err(e)) => {
                    warn!(error = %e, "mdns: browse channel closed");
                    break;
                },
                Err(_) => break,
            }
        }

        if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
            debug!(error = %e, "mdns: stop_browse failed");
        }
        Ok(found.into_values().collect())
    }
}

const TXT_KEYS: &[&str] = &[
    "name",
    "version",
    "requireAuth",
    "capabilities",
    "transport",
    "transports",
];

fn txt_properties(a: &Announcement) -> HashMap<String, String> {
    HashMap::from([
        ("name".to_string(), a.name.clone()),
        ("version".to_string(), a.version.clone()),
        ("requireAuth".to_string(), a.require_auth.to_string()),
        ("capabilities".to_string(), a.capabilities.join(",")),
        ("transport".to_string(), a.transport.clone()),
        ("transports".to_string(), a.transports.join(",")),
    ])
}

fn record_from_txt(host: &str, port: u16, props: &HashMap<String, String>) -> DiscoveryRecord {
    let get = |k: &str| props.get(k).cloned().unwrap_or_default();
    let name = props
        .get("name")
        .filter(|n| !n.is_empty())
        .cloned()
        .unwrap_or_else(|| host.to_string());
    let transport = props
        .get("transport")
        .filter(|t| !t.is_empty())
        .cloned()
        .unwrap_or_else(|| TRANSPORT_WEBSOCKET.into());
    let mut transports = comma_list(&get("transports"));
    if transports.is_empty() {
        transports.push(transport.clone());
    }
    DiscoveryRecord {
        name,
        url: DiscoveryRecord::ws_url(host, port),
        host: host.to_string(),
        port,
        transport,
        transports,
        require_auth: get("requireAuth") == "true",
        capabilities: comma_list(&get("capabilities")),
        version: get("version"),
    }
}

/// DNS-SD instance labels may not contain dots.
fn instance_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '.' { '-' } else { c })
        .collect();
    if cleaned.trim().is_empty() {
        "switchyard".into()
    } else {
        cleaned
    }
}

/// Wildcard binds advertise every interface address; a concrete bind
/// address is advertised as-is.
fn advertised_ip(host: &str) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => ip.to_string(),
        _ => String::new(),
    }
}
