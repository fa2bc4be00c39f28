//! Parse untyped JSON into a [`GatewayMessage`].
//!
//! Fields are looked up in `payload` first and then on the envelope itself,
//! so `{"type":"direct","targetNodeId":"n2","payload":{"message":1}}` and
//! `{"type":"direct","payload":{"targetNodeId":"n2","message":1}}` are
//! equivalent.

use serde_json::{Map, Value};

use crate::{
    envelope::{
        BroadcastPayload, DirectPayload, ErrorPayload, GatewayMessage, JoinGroupPayload,
        LeaveGroupPayload, MessageType, RegisterPayload, now_ms,
    },
    error::ValidationError,
};

/// A validated frame plus the envelope metadata dispatch cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Caller-declared node id. Only the HTTP bridge relies on it.
    pub node_id: Option<String>,
    pub timestamp: u64,
    pub message: GatewayMessage,
}

impl Inbound {
    pub fn kind(&self) -> MessageType {
        self.message.kind()
    }
}

pub fn validate(raw: &str) -> Result<Inbound, ValidationError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::Json(e.to_string()))?;
    validate_value(value)
}

pub fn validate_value(value: Value) -> Result<Inbound, ValidationError> {
    let Value::Object(envelope) = value else {
        return Err(ValidationError::NotAnObject);
    };

    let kind = match envelope.get("type") {
        None | Some(Value::Null) => return Err(ValidationError::MissingType),
        Some(Value::String(s)) => {
            MessageType::parse(s).ok_or_else(|| ValidationError::UnrecognizedType(s.clone()))?
        },
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "type",
                expected: "string",
            });
        },
    };

    let node_id = opt_string(&envelope, "nodeId")?;
    let timestamp = match envelope.get("timestamp") {
        None | Some(Value::Null) => now_ms(),
        Some(v) => parse_timestamp(v)?,
    };

    let payload = match envelope.get("payload") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        // ack payloads are opaque; everything else must be an object.
        Some(_) if kind == MessageType::Ack => None,
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "payload",
                expected: "object",
            });
        },
    };
    let fields = Fields {
        payload,
        envelope: &envelope,
    };

    let message = match kind {
        MessageType::Register => GatewayMessage::Register(parse_register(&fields)?),
        MessageType::Unregister => GatewayMessage::Unregister,
        MessageType::JoinGroup => GatewayMessage::JoinGroup(parse_join(&fields)?),
        MessageType::LeaveGroup => GatewayMessage::LeaveGroup(LeaveGroupPayload {
            group_id: fields.string("groupId")?,
            group_name: fields.string("groupName")?,
        }),
        MessageType::Broadcast => GatewayMessage::Broadcast(BroadcastPayload {
            group_id: fields.required_string("groupId")?,
            message: fields.required_value("message")?,
        }),
        MessageType::Direct => GatewayMessage::Direct(DirectPayload {
            target_node_id: fields.required_string("targetNodeId")?,
            message: fields.required_value("message")?,
        }),
        MessageType::Ping => GatewayMessage::Ping,
        MessageType::Pong => GatewayMessage::Pong,
        MessageType::Ack => GatewayMessage::Ack(envelope.get("payload").cloned()),
        MessageType::Error => GatewayMessage::Error(ErrorPayload {
            code: fields.required_string("code")?,
            message: fields.string("message")?.unwrap_or_default(),
        }),
    };

    Ok(Inbound {
        node_id,
        timestamp,
        message,
    })
}

/// Any finite non-negative JSON number, truncated to whole milliseconds.
fn parse_timestamp(v: &Value) -> Result<u64, ValidationError> {
    if let Some(ms) = v.as_u64() {
        return Ok(ms);
    }
    match v.as_f64() {
        Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms.trunc() as u64),
        _ => Err(ValidationError::InvalidField {
            field: "timestamp",
            expected: "non-negative number",
        }),
    }
}

fn parse_register(fields: &Fields<'_>) -> Result<RegisterPayload, ValidationError> {
    let name = fields.required_string("name")?;
    if name.trim().is_empty() {
        return Err(ValidationError::Constraint("name must not be empty"));
    }
    let capabilities = match fields.lookup("capabilities") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(ValidationError::InvalidField {
                        field: "capabilities",
                        expected: "array of strings",
                    })
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "capabilities",
                expected: "array of strings",
            });
        },
    };
    Ok(RegisterPayload {
        name,
        capabilities,
        session_id: fields.string("sessionId")?,
        agent_name: fields.string("agentName")?,
        token: fields.string("token")?,
    })
}

fn parse_join(fields: &Fields<'_>) -> Result<JoinGroupPayload, ValidationError> {
    let group_id = fields.string("groupId")?;
    let group_name = fields.string("groupName")?;
    if group_id.is_none() && group_name.is_none() {
        return Err(ValidationError::Constraint(
            "join_group requires groupId or groupName",
        ));
    }
    let create_if_not_exists = match fields.lookup("createIfNotExists") {
        None => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "createIfNotExists",
                expected: "boolean",
            });
        },
    };
    Ok(JoinGroupPayload {
        group_id,
        group_name,
        create_if_not_exists,
        description: fields.string("description")?,
    })
}

fn opt_string(map: &Map<String, Value>, key: &'static str) -> Result<Option<String>, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::InvalidField {
            field: key,
            expected: "string",
        }),
    }
}

/// Field lookup over `payload`, falling back to the envelope.
struct Fields<'a> {
    payload: Option<&'a Map<String, Value>>,
    envelope: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.payload
            .and_then(|p| p.get(key))
            .or_else(|| self.envelope.get(key))
            .filter(|v| !v.is_null())
    }

    fn string(&self, key: &'static str) -> Result<Option<String>, ValidationError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ValidationError::InvalidField {
                field: key,
                expected: "string",
            }),
        }
    }

    fn required_string(&self, key: &'static str) -> Result<String, ValidationError> {
        self.string(key)?.ok_or(ValidationError::MissingField(key))
    }

    fn required_value(&self, key: &'static str) -> Result<Value, ValidationError> {
        self.payload
            .and_then(|p| p.get(key))
            .cloned()
            .ok_or(ValidationError::MissingField(key))
    }
}
