//! Gateway: WebSocket/HTTP relay between registered nodes.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Bind, start the HTTP server (health, stats, bridge)
//! 3. Attach the WebSocket upgrade handler
//! 4. Start the heartbeat monitor and discovery announcement
//!
//! Message handling lives in `dispatch.rs` and is shared by both transports.

pub mod auth;
pub mod bridge;
pub mod dispatch;
pub mod groups;
pub mod heartbeat;
pub mod nodes;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    server::{GatewayHandle, build_gateway_app, start_gateway},
    state::GatewayState,
};
