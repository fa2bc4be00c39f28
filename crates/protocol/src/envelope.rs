use std::time::{SystemTime, UNIX_EPOCH};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::ErrorShape;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Message type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Unregister,
    JoinGroup,
    LeaveGroup,
    Broadcast,
    Direct,
    Ping,
    Pong,
    Ack,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        Self::Register,
        Self::Unregister,
        Self::JoinGroup,
        Self::LeaveGroup,
        Self::Broadcast,
        Self::Direct,
        Self::Ping,
        Self::Pong,
        Self::Ack,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::JoinGroup => "join_group",
            Self::LeaveGroup => "leave_group",
            Self::Broadcast => "broadcast",
            Self::Direct => "direct",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Types that are neither counted nor checked by the rate limiter.
    pub fn is_rate_limit_exempt(self) -> bool {
        matches!(self, Self::Register | Self::Ping | Self::Pong)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The only unit ever placed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default = "now_ms")]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            node_id: None,
            group_id: None,
            target_node_id: None,
            payload: None,
            timestamp: now_ms(),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn ack(payload: Value) -> Self {
        Self::new(MessageType::Ack).with_payload(payload)
    }

    pub fn error(err: &ErrorShape) -> Self {
        Self::new(MessageType::Error).with_payload(serde_json::json!({
            "code": err.code,
            "message": err.message,
        }))
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    /// Group fan-out frame as seen by receivers: `nodeId` is the sender.
    pub fn broadcast(from: &str, group_id: &str, message: Value) -> Self {
        Self::new(MessageType::Broadcast)
            .with_node_id(from)
            .with_group_id(group_id)
            .with_payload(message)
    }

    pub fn direct(from: &str, target: &str, message: Value) -> Self {
        let mut env = Self::new(MessageType::Direct)
            .with_node_id(from)
            .with_payload(message);
        env.target_node_id = Some(target.to_string());
        env
    }

    /// The error code carried by an `error` envelope, if any.
    pub fn error_code(&self) -> Option<&str> {
        if self.kind != MessageType::Error {
            return None;
        }
        self.payload.as_ref()?.get("code")?.as_str()
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and `Value`s cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterPayload {
    pub name: String,
    pub capabilities: Vec<String>,
    pub session_id: Option<String>,
    pub agent_name: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinGroupPayload {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    /// `None` means the client did not say; joins by name then create.
    pub create_if_not_exists: Option<bool>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveGroupPayload {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastPayload {
    pub group_id: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectPayload {
    pub target_node_id: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// A validated inbound message, one variant per wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    Register(RegisterPayload),
    Unregister,
    JoinGroup(JoinGroupPayload),
    LeaveGroup(LeaveGroupPayload),
    Broadcast(BroadcastPayload),
    Direct(DirectPayload),
    Ping,
    Pong,
    Ack(Option<Value>),
    Error(ErrorPayload),
}

impl GatewayMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Register(_) => MessageType::Register,
            Self::Unregister => MessageType::Unregister,
            Self::JoinGroup(_) => MessageType::JoinGroup,
            Self::LeaveGroup(_) => MessageType::LeaveGroup,
            Self::Broadcast(_) => MessageType::Broadcast,
            Self::Direct(_) => MessageType::Direct,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Ack(_) => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
        }
    }
}
