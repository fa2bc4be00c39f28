//! Wire protocol shared by every switchyard transport.
//!
//! One JSON envelope shape travels over both the WebSocket path and the HTTP
//! long-poll bridge. Inbound frames go through [`validate`] which produces a
//! strongly-typed [`GatewayMessage`]; outbound frames are built with the
//! [`Envelope`] constructors.

pub mod envelope;
pub mod error;
pub mod validate;

pub use {
    envelope::{
        BroadcastPayload, DirectPayload, Envelope, ErrorPayload, GatewayMessage, JoinGroupPayload,
        LeaveGroupPayload, MessageType, RegisterPayload, now_ms,
    },
    error::ValidationError,
    validate::{Inbound, validate, validate_value},
};

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Default heartbeat sweep period.
pub const PING_INTERVAL_MS: u64 = 30_000;

/// Default silence after which a node is evicted.
pub const PING_TIMEOUT_MS: u64 = 60_000;

/// How long `GET /bridge/poll` waits for an empty mailbox.
pub const BRIDGE_POLL_TIMEOUT_MS: u64 = 30_000;

/// Header carrying the caller's node id on bridge polls.
pub const NODE_ID_HEADER: &str = "X-Node-ID";

/// Default registry capacity.
pub const DEFAULT_MAX_NODES: usize = 1000;

// ── Errors ───────────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const MAX_NODES_REACHED: &str = "MAX_NODES_REACHED";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const NOT_REGISTERED: &str = "NOT_REGISTERED";
    pub const GROUP_NOT_FOUND: &str = "GROUP_NOT_FOUND";
    pub const NODE_NOT_FOUND: &str = "NODE_NOT_FOUND";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Error reported back to a connection inside an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Errors after which the connection is closed.
    pub fn is_fatal(&self) -> bool {
        self.code == error_codes::AUTH_FAILED || self.code == error_codes::MAX_NODES_REACHED
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<ValidationError> for ErrorShape {
    fn from(err: ValidationError) -> Self {
        Self::new(error_codes::INVALID_MESSAGE, err.to_string())
    }
}
