use std::time::Duration;

use {
    anyhow::Result,
    switchyard_config::{DiscoveryMethod, GatewayConfig},
    switchyard_discovery::{DiscoveryRecord, from_method},
};

pub async fn discover(
    config: &GatewayConfig,
    method: Option<DiscoveryMethod>,
    timeout_ms: u64,
    json: bool,
) -> Result<()> {
    let method = method.unwrap_or(config.discovery.method);
    let backend = from_method(method, &config.discovery.tailscale_tag, config.port);

    let records = backend.discover(Duration::from_millis(timeout_ms)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        eprintln!("No gateways found via {method} within {timeout_ms}ms.");
    } else {
        for line in render(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

fn render(records: &[DiscoveryRecord]) -> Vec<String> {
    let width = records.iter().map(|r| r.name.len()).max().unwrap_or(0);
    records
        .iter()
        .map(|r| {
            let auth = if r.require_auth {
                "auth"
            } else {
                "open"
            };
            format!("{:<width$}  {}  {}  v{}", r.name, r.url, auth, r.version)
        })
        .collect()
}
