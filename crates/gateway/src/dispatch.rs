//! Transport-independent message handling.
//!
//! Both the WebSocket loop and the bridge endpoints feed validated envelopes
//! through [`dispatch`]. Replies come back in an [`Outcome`]; deliveries to
//! other nodes go straight through the registry.

use {serde_json::json, tracing::{debug, warn}};

use switchyard_protocol::{
    BroadcastPayload, DirectPayload, Envelope, ErrorShape, GatewayMessage, Inbound,
    JoinGroupPayload, LeaveGroupPayload, RegisterPayload, error_codes, validate,
};

use crate::{nodes::NodeSink, state::GatewayState};

// ── Session ──────────────────────────────────────────────────────────────────

/// Per-connection binding between a transport and at most one node.
#[derive(Debug)]
pub struct Session {
    pub conn_id: String,
    pub node_id: Option<String>,
    pub sink: NodeSink,
}

impl Session {
    pub fn new(sink: NodeSink) -> Self {
        Self {
            conn_id: uuid::Uuid::new_v4().to_string(),
            node_id: None,
            sink,
        }
    }

    /// A session already bound to a registered node.
    pub fn bound(node_id: String, sink: NodeSink) -> Self {
        Self {
            node_id: Some(node_id),
            ..Self::new(sink)
        }
    }
}

/// Replies for the sending connection, and whether to close it afterwards.
#[derive(Debug, Default)]
pub struct Outcome {
    pub replies: Vec<Envelope>,
    pub close: bool,
}

impl Outcome {
    fn none() -> Self {
        Self::default()
    }

    fn reply(envelope: Envelope) -> Self {
        Self {
            replies: vec![envelope],
            close: false,
        }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        let shape = ErrorShape::new(code, message);
        Self {
            close: shape.is_fatal(),
            replies: vec![Envelope::error(&shape)],
        }
    }

    /// Code and message of the first error reply, if any.
    pub fn first_error(&self) -> Option<(&str, &str)> {
        self.replies.iter().find_map(|env| {
            let code = env.error_code()?;
            let message = env
                .payload
                .as_ref()
                .and_then(|p| p["message"].as_str())
                .unwrap_or_default();
            Some((code, message))
        })
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Validate one raw frame and dispatch it. Malformed frames get an
/// `INVALID_MESSAGE` error and never close the connection.
pub async fn handle_text(state: &GatewayState, session: &mut Session, raw: &str) -> Outcome {
    match validate(raw) {
        Ok(inbound) => dispatch(state, session, inbound).await,
        Err(e) => {
            debug!(conn_id = %session.conn_id, error = %e, "rejected malformed frame");
            let shape = ErrorShape::from(e);
            Outcome::error(&shape.code, shape.message)
        },
    }
}

pub async fn dispatch(state: &GatewayState, session: &mut Session, inbound: Inbound) -> Outcome {
    let kind = inbound.kind();

    if !kind.is_rate_limit_exempt()
        && let Some(node_id) = session.node_id.clone()
    {
        let mut nodes = state.nodes.write().await;
        if !nodes.contains(&node_id) {
            // Evicted or removed elsewhere; handlers below report NOT_REGISTERED.
            session.node_id = None;
        } else if !nodes.admit_message(&node_id) {
            warn!(node_id = %node_id, kind = %kind, "rate limit exceeded");
            return Outcome::error(error_codes::RATE_LIMITED, "rate limit exceeded");
        }
    }

    match inbound.message {
        GatewayMessage::Register(p) => register(state, session, p).await,
        GatewayMessage::Unregister => unregister(state, session).await,
        GatewayMessage::JoinGroup(p) => join_group(state, session, p).await,
        GatewayMessage::LeaveGroup(p) => leave_group(state, session, p).await,
        GatewayMessage::Broadcast(p) => broadcast(state, session, p).await,
        GatewayMessage::Direct(p) => direct(state, session, p).await,
        GatewayMessage::Ping => {
            touch(state, session).await;
            Outcome::reply(Envelope::pong())
        },
        GatewayMessage::Pong => {
            touch(state, session).await;
            Outcome::none()
        },
        GatewayMessage::Ack(_) | GatewayMessage::Error(_) => Outcome::error(
            error_codes::UNKNOWN_MESSAGE_TYPE,
            format!("'{kind}' is not accepted from clients"),
        ),
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn not_registered(session: &mut Session) -> Outcome {
    session.node_id = None;
    Outcome::error(error_codes::NOT_REGISTERED, "register before sending this message")
}

async fn touch(state: &GatewayState, session: &mut Session) {
    let Some(node_id) = session.node_id.clone() else {
        return;
    };
    if !state.nodes.write().await.update_ping(&node_id) {
        session.node_id = None;
    }
}

async fn register(state: &GatewayState, session: &mut Session, p: RegisterPayload) -> Outcome {
    if let Some(node_id) = session.node_id.clone() {
        if state.nodes.read().await.contains(&node_id) {
            return Outcome::error(
                error_codes::INVALID_REQUEST,
                format!("connection is already registered as {node_id}"),
            );
        }
        session.node_id = None;
    }

    if !state.auth.validate_token(p.token.as_deref()).await {
        warn!(conn_id = %session.conn_id, name = %p.name, "registration rejected: invalid token");
        return Outcome::error(error_codes::AUTH_FAILED, "invalid or missing auth token");
    }

    let mut nodes = state.nodes.write().await;
    let max_nodes = nodes.max_nodes();
    let Some(node) = nodes.register_node(
        session.sink.clone(),
        &p.name,
        p.capabilities,
        p.session_id,
        p.agent_name,
    ) else {
        warn!(conn_id = %session.conn_id, max_nodes, "registration rejected: gateway full");
        return Outcome::error(
            error_codes::MAX_NODES_REACHED,
            format!("gateway is at capacity ({max_nodes} nodes)"),
        );
    };

    let ack = Envelope::ack(json!({
        "nodeId": node.id,
        "name": node.name,
        "sessionId": node.session_id,
        "agentName": node.agent_name,
    }))
    .with_node_id(node.id.clone());
    session.node_id = Some(node.id.clone());
    Outcome::reply(ack)
}

async fn unregister(state: &GatewayState, session: &mut Session) -> Outcome {
    let Some(node_id) = session.node_id.take() else {
        return not_registered(session);
    };
    if state.remove_node(&node_id).await.is_none() {
        return not_registered(session);
    }
    Outcome::reply(Envelope::ack(json!({ "nodeId": node_id })))
}

async fn join_group(state: &GatewayState, session: &mut Session, p: JoinGroupPayload) -> Outcome {
    let Some(node_id) = session.node_id.clone() else {
        return not_registered(session);
    };

    let mut nodes = state.nodes.write().await;
    if !nodes.contains(&node_id) {
        return not_registered(session);
    }
    let mut groups = state.groups.write().await;

    let (group_id, group_name, created) = if let Some(group_id) = p.group_id {
        match groups.get_group(&group_id) {
            Some(g) => (g.id.clone(), g.name.clone(), false),
            None => {
                return Outcome::error(
                    error_codes::GROUP_NOT_FOUND,
                    format!("group not found: {group_id}"),
                );
            },
        }
    } else if let Some(name) = p.group_name {
        let existing = groups
            .get_group_by_name(&name)
            .map(|g| (g.id.clone(), g.name.clone()));
        match existing {
            Some((id, name)) => (id, name, false),
            None if p.create_if_not_exists.unwrap_or(true) => {
                let (g, created) = groups.get_or_create_group(&name, &node_id, p.description);
                (g.id.clone(), g.name.clone(), created)
            },
            None => {
                return Outcome::error(
                    error_codes::GROUP_NOT_FOUND,
                    format!("group not found: {name}"),
                );
            },
        }
    } else {
        return Outcome::error(
            error_codes::INVALID_REQUEST,
            "join_group requires groupId or groupName",
        );
    };

    groups.add_node_to_group(&group_id, &node_id);
    nodes.note_joined(&node_id, &group_id);
    debug!(node_id = %node_id, group_id = %group_id, created, "joined group");

    Outcome::reply(
        Envelope::ack(json!({
            "groupId": group_id,
            "groupName": group_name,
            "created": created,
        }))
        .with_group_id(group_id),
    )
}

async fn leave_group(state: &GatewayState, session: &mut Session, p: LeaveGroupPayload) -> Outcome {
    let Some(node_id) = session.node_id.clone() else {
        return not_registered(session);
    };

    let mut nodes = state.nodes.write().await;
    if !nodes.contains(&node_id) {
        return not_registered(session);
    }
    let mut groups = state.groups.write().await;

    let found = match (&p.group_id, &p.group_name) {
        (Some(id), _) => groups.get_group(id),
        (None, Some(name)) => groups.get_group_by_name(name),
        (None, None) => {
            return Outcome::error(
                error_codes::INVALID_REQUEST,
                "leave_group requires groupId or groupName",
            );
        },
    }
    .map(|g| (g.id.clone(), g.name.clone()));
    let Some((group_id, group_name)) = found else {
        let wanted = p.group_id.or(p.group_name).unwrap_or_default();
        return Outcome::error(
            error_codes::GROUP_NOT_FOUND,
            format!("group not found: {wanted}"),
        );
    };

    groups.remove_node_from_group(&group_id, &node_id);
    nodes.note_left(&node_id, &group_id);
    debug!(node_id = %node_id, group_id = %group_id, "left group");

    Outcome::reply(
        Envelope::ack(json!({ "groupId": group_id, "groupName": group_name }))
            .with_group_id(group_id),
    )
}

async fn broadcast(state: &GatewayState, session: &mut Session, p: BroadcastPayload) -> Outcome {
    let Some(node_id) = session.node_id.clone() else {
        return not_registered(session);
    };

    let nodes = state.nodes.read().await;
    if !nodes.contains(&node_id) {
        return not_registered(session);
    }
    let recipients: Vec<String> = {
        let groups = state.groups.read().await;
        let Some(group) = groups.get_group(&p.group_id) else {
            return Outcome::error(
                error_codes::GROUP_NOT_FOUND,
                format!("group not found: {}", p.group_id),
            );
        };
        group
            .members
            .iter()
            .filter(|m| **m != node_id)
            .cloned()
            .collect()
    };

    let envelope = Envelope::broadcast(&node_id, &p.group_id, p.message);
    let delivered = nodes.broadcast_to_nodes(&recipients, &envelope);
    debug!(
        node_id = %node_id,
        group_id = %p.group_id,
        recipients = recipients.len(),
        delivered,
        "broadcast"
    );
    Outcome::none()
}

async fn direct(state: &GatewayState, session: &mut Session, p: DirectPayload) -> Outcome {
    let Some(node_id) = session.node_id.clone() else {
        return not_registered(session);
    };

    let nodes = state.nodes.read().await;
    if !nodes.contains(&node_id) {
        return not_registered(session);
    }
    if !nodes.contains(&p.target_node_id) {
        return Outcome::error(
            error_codes::NODE_NOT_FOUND,
            format!("node not found: {}", p.target_node_id),
        );
    }
    let envelope = Envelope::direct(&node_id, &p.target_node_id, p.message);
    nodes.send_to_node(&p.target_node_id, &envelope);
    Outcome::none()
}
