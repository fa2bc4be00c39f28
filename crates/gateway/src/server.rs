use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tokio::task::JoinHandle,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    switchyard_config::GatewayConfig,
    switchyard_discovery::{Discovery, from_method},
};

use crate::{bridge, heartbeat::HeartbeatMonitor, state::GatewayState, ws::handle_connection};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/bridge/send", post(bridge::send_handler))
        .route("/bridge/poll", get(bridge::poll_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// A running gateway.
pub struct GatewayHandle {
    pub local_addr: SocketAddr,
    state: Arc<GatewayState>,
    server: JoinHandle<std::io::Result<()>>,
    heartbeat: JoinHandle<()>,
    discovery: Option<Box<dyn Discovery>>,
}

impl GatewayHandle {
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Run until something cancels the shutdown token, then finish stopping.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.state.shutdown.cancelled().await;
        self.stop().await
    }

    /// Stop accepting work, close every connection and wait for the server
    /// task to finish.
    pub async fn stop(self) -> anyhow::Result<()> {
        info!("gateway stopping");
        self.state.shutdown.cancel();

        if let Some(discovery) = &self.discovery
            && let Err(e) = discovery.stop_announcing().await
        {
            warn!(error = %e, "failed to withdraw discovery announcement");
        }
        self.state.close_bridge_mailboxes().await;

        let _ = self.heartbeat.await;
        match tokio::time::timeout(Duration::from_secs(10), self.server).await {
            Ok(joined) => joined??,
            Err(_) => warn!("server did not drain within 10s"),
        }
        info!("gateway stopped");
        Ok(())
    }
}

/// Bind, start the heartbeat and discovery, and serve in the background.
pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<GatewayHandle> {
    config.validate()?;
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let state = GatewayState::new(config);
    let app = build_gateway_app(Arc::clone(&state));

    // Startup banner.
    let lines = [
        format!("switchyard gateway v{}", state.version),
        format!(
            "protocol v{}, listening on {}",
            switchyard_protocol::PROTOCOL_VERSION,
            local_addr
        ),
        format!(
            "auth: {}, max nodes: {}",
            if state.auth.require_auth() {
                "required"
            } else {
                "open"
            },
            state.config.max_nodes
        ),
        format!(
            "heartbeat: every {}ms, timeout {}ms",
            state.config.ping_interval_ms, state.config.ping_timeout_ms
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let heartbeat =
        HeartbeatMonitor::from_state(Arc::clone(&state)).spawn(state.shutdown.child_token());

    let discovery = if state.config.discovery.enabled {
        let d = from_method(
            state.config.discovery.method,
            &state.config.discovery.tailscale_tag,
            local_addr.port(),
        );
        match d.announce(&state.announcement(local_addr.port())).await {
            Ok(()) => {
                info!(method = %d.method(), "discovery announcement started");
                Some(d)
            },
            Err(e) => {
                warn!(error = %e, "discovery announcement failed, continuing without it");
                None
            },
        }
    } else {
        None
    };

    // Run the server with ConnectInfo for remote IP extraction.
    let shutdown = state.shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    });

    Ok(GatewayHandle {
        local_addr,
        state,
        server,
        heartbeat,
        discovery,
    })
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.health().await)
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.stats().await)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}
