mod discover_commands;
mod token_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use switchyard_config::{DiscoveryMethod, GatewayConfig};

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: message gateway for cooperating agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the config
    /// file's `log_level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Auth token management.
    Token {
        #[command(subcommand)]
        action: token_commands::TokenAction,
    },
    /// Find gateways on the local network or tailnet.
    Discover {
        /// Defaults to the config's discovery method.
        #[arg(long)]
        method: Option<DiscoveryMethod>,
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
        /// Print records as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_telemetry(cli: &Cli, config: &GatewayConfig) {
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    match &cli.config {
        Some(path) => switchyard_config::load_config(path),
        None => switchyard_config::discover_and_load(),
    }
}

async fn run_gateway(mut config: GatewayConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let handle = switchyard_gateway::start_gateway(config).await?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received Ctrl-C");
        },
        _ = handle.state().shutdown.cancelled() => {},
    }
    handle.stop().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_telemetry(&cli, &config);

    info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");

    match cli.command {
        Commands::Gateway { host, port } => run_gateway(config, host, port).await,
        Commands::Token { action } => token_commands::handle_token(action),
        Commands::Discover {
            method,
            timeout_ms,
            json,
        } => discover_commands::discover(&config, method, timeout_ms, json).await,
    }
}
