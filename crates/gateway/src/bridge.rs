//! HTTP long-poll bridge for clients that cannot hold a WebSocket open.
//!
//! Bridge nodes live in the same registry as WebSocket nodes; their
//! connection handle is a [`BridgeMailbox`] that `GET /bridge/poll` drains.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    axum::{
        Json,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
    },
    tokio::sync::oneshot,
    tracing::{debug, warn},
};

use switchyard_protocol::{Envelope, GatewayMessage, NODE_ID_HEADER, error_codes, validate};

use crate::{
    dispatch::{Session, dispatch},
    nodes::{NodeSink, Transport},
    state::GatewayState,
};

// ── Mailbox ──────────────────────────────────────────────────────────────────

struct MailboxInner {
    queue: VecDeque<Envelope>,
    /// Wake-up for the single outstanding poll, if any.
    waiter: Option<oneshot::Sender<()>>,
    closed: bool,
}

/// Bounded outbound queue for one bridge node.
pub struct BridgeMailbox {
    inner: Mutex<MailboxInner>,
    capacity: usize,
}

impl std::fmt::Debug for BridgeMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMailbox")
            .field("queued", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl BridgeMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                queue: VecDeque::new(),
                waiter: None,
                closed: false,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue an envelope and wake the pending poll. When full, the oldest
    /// message is dropped. Returns false once the mailbox is closed.
    pub fn push(&self, envelope: Envelope) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            warn!(capacity = self.capacity, "bridge mailbox full, dropped oldest message");
        }
        inner.queue.push_back(envelope);
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(());
        }
        true
    }

    pub fn drain(&self) -> Vec<Envelope> {
        self.lock().queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_waiter(&self) -> bool {
        self.lock().waiter.is_some()
    }

    /// Return queued messages now, or wait up to `timeout` for one to arrive.
    ///
    /// Only one poll waits at a time: a newer call supersedes the older one,
    /// which returns empty immediately and leaves the queue to the newer poll.
    pub async fn wait(&self, timeout: Duration) -> Vec<Envelope> {
        let rx = {
            let mut inner = self.lock();
            if !inner.queue.is_empty() {
                return inner.queue.drain(..).collect();
            }
            if inner.closed {
                return Vec::new();
            }
            let (tx, rx) = oneshot::channel();
            if inner.waiter.replace(tx).is_some() {
                debug!("bridge poll superseded by a newer poll");
            }
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => self.drain(),
            // Superseded or closed.
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                let mut inner = self.lock();
                if inner.waiter.as_ref().is_some_and(|w| w.is_closed()) {
                    inner.waiter = None;
                }
                inner.queue.drain(..).collect()
            },
        }
    }

    /// Reject further pushes and release any waiting poll with an empty
    /// result.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.waiter = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ── HTTP handlers ────────────────────────────────────────────────────────────

fn bridge_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into(), "code": code })),
    )
        .into_response()
}

fn status_for(code: &str) -> StatusCode {
    match code {
        error_codes::AUTH_FAILED => StatusCode::UNAUTHORIZED,
        error_codes::MAX_NODES_REACHED => StatusCode::SERVICE_UNAVAILABLE,
        error_codes::NODE_NOT_FOUND | error_codes::GROUP_NOT_FOUND => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// `POST /bridge/send`: one envelope per call.
pub async fn send_handler(State(state): State<Arc<GatewayState>>, body: String) -> Response {
    let inbound = match validate(&body) {
        Ok(inbound) => inbound,
        Err(e) => return bridge_error(StatusCode::BAD_REQUEST, error_codes::INVALID_MESSAGE, e.to_string()),
    };

    if matches!(inbound.message, GatewayMessage::Register(_)) {
        let mailbox = Arc::new(BridgeMailbox::new(state.config.bridge.mailbox_capacity));
        let mut session = Session::new(NodeSink::Bridge(mailbox));
        let outcome = dispatch(&state, &mut session, inbound).await;
        return match session.node_id {
            Some(node_id) => Json(serde_json::json!({
                "type": "registered",
                "nodeId": node_id,
            }))
            .into_response(),
            None => {
                let (code, message) = outcome
                    .first_error()
                    .unwrap_or((error_codes::INVALID_REQUEST, "registration failed"));
                bridge_error(status_for(code), code, message)
            },
        };
    }

    let Some(node_id) = inbound.node_id.clone() else {
        return bridge_error(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "nodeId is required for bridge messages",
        );
    };
    let sink = {
        let nodes = state.nodes.read().await;
        match nodes.get(&node_id) {
            Some(node) if node.transport() == Transport::Bridge => node.sink.clone(),
            _ => {
                return bridge_error(
                    StatusCode::NOT_FOUND,
                    error_codes::NOT_REGISTERED,
                    format!("unknown bridge node: {node_id}"),
                );
            },
        }
    };

    let mut session = Session::bound(node_id, sink);
    let outcome = dispatch(&state, &mut session, inbound).await;
    Json(outcome.replies).into_response()
}

/// `GET /bridge/poll`: drain the caller's mailbox, long-polling when empty.
pub async fn poll_handler(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let Some(node_id) = headers
        .get(NODE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return bridge_error(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            format!("missing {NODE_ID_HEADER} header"),
        );
    };

    let mailbox = {
        let mut nodes = state.nodes.write().await;
        let Some(mailbox) = nodes.get(node_id).and_then(|n| n.sink.mailbox().cloned()) else {
            return bridge_error(
                StatusCode::NOT_FOUND,
                error_codes::NOT_REGISTERED,
                format!("unknown bridge node: {node_id}"),
            );
        };
        // Polling is how a bridge node shows it is alive.
        nodes.update_ping(node_id);
        mailbox
    };

    let timeout = Duration::from_millis(state.config.bridge.poll_timeout_ms);
    let messages = tokio::select! {
        messages = mailbox.wait(timeout) => messages,
        _ = state.shutdown.cancelled() => Vec::new(),
    };
    Json(messages).into_response()
}
