//! Startup configuration for the switchyard gateway.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config, set_config_dir, clear_config_dir, update_config},
    schema::{
        BridgeConfig, DiscoveryConfig, DiscoveryMethod, GatewayConfig, RateLimitConfig,
    },
};
