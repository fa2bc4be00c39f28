use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket, close_code},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    dispatch::{self, Session},
    nodes::{NodeSink, Outbound},
    state::GatewayState,
};

/// Serve one WebSocket connection until either side closes it.
///
/// Frames from the peer are handled strictly in arrival order. Everything
/// bound for the peer, replies and deliveries from other nodes alike, goes
/// through one bounded channel drained by a dedicated writer task. A peer
/// that stops reading loses frames once that channel fills.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.ws_outbound_capacity);

    let mut session = Session::new(NodeSink::WebSocket(tx.clone()));
    let conn_id = session.conn_id.clone();
    info!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!(conn_id = %write_conn_id, "ws: write failed, peer gone");
                        break;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = tx.try_send(Outbound::Close {
                    code: close_code::AWAY,
                    reason: "gateway shutting down".into(),
                });
                break;
            },
            msg = ws_rx.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            // Transport-level ping/pong is answered by the library; the
            // protocol's own heartbeat travels in text frames.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        let outcome = dispatch::handle_text(&state, &mut session, text.as_str()).await;
        for reply in &outcome.replies {
            session.sink.deliver(reply);
        }
        if outcome.close {
            let reason = outcome
                .first_error()
                .map(|(code, _)| code.to_string())
                .unwrap_or_default();
            warn!(conn_id = %conn_id, reason = %reason, "ws: closing connection after fatal error");
            session.sink.disconnect(close_code::POLICY, &reason);
            break;
        }
    }

    if let Some(node_id) = session.node_id.take() {
        state.remove_node(&node_id).await;
    }
    // Dropping the last senders lets the writer drain and exit.
    drop(session);
    drop(tx);
    let _ = write_handle.await;

    info!(conn_id = %conn_id, "ws: connection closed");
}
