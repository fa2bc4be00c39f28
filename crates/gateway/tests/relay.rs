#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use {
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::TcpStream,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    switchyard_config::{BridgeConfig, GatewayConfig},
    switchyard_gateway::{GatewayHandle, start_gateway},
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        bridge: BridgeConfig {
            poll_timeout_ms: 300,
            mailbox_capacity: 100,
        },
        ..Default::default()
    }
}

async fn start(config: GatewayConfig) -> GatewayHandle {
    start_gateway(config).await.unwrap()
}

fn http(gw: &GatewayHandle, path: &str) -> String {
    format!("http://{}{}", gw.local_addr, path)
}

async fn connect(gw: &GatewayHandle) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws", gw.local_addr))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next application frame, skipping heartbeat pings.
async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

async fn register(ws: &mut Ws, name: &str) -> String {
    send(ws, json!({"type": "register", "payload": {"name": name}})).await;
    let ack = recv(ws).await;
    assert_eq!(ack["type"], "ack", "unexpected reply: {ack}");
    ack["payload"]["nodeId"].as_str().unwrap().to_string()
}

/// Close code the server ends the socket with, skipping earlier frames.
async fn close_code(ws: &mut Ws) -> Option<u16> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Close(frame) = msg {
                return frame.map(|f| u16::from(f.code));
            }
        }
        None
    })
    .await
    .unwrap()
}

async fn bridge_send(client: &reqwest::Client, gw: &GatewayHandle, body: Value) -> Value {
    client
        .post(http(gw, "/bridge/send"))
        .body(body.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn bridge_poll(client: &reqwest::Client, gw: &GatewayHandle, node_id: &str) -> Vec<Value> {
    client
        .get(http(gw, "/bridge/poll"))
        .header("X-Node-ID", node_id)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn stats(gw: &GatewayHandle) -> Value {
    reqwest::get(http(gw, "/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn group_broadcast_reaches_other_members() {
    let gw = start(test_config()).await;
    let mut a = connect(&gw).await;
    let mut b = connect(&gw).await;
    let mut c = connect(&gw).await;
    let a_id = register(&mut a, "A").await;
    register(&mut b, "B").await;
    register(&mut c, "C").await;

    let mut gid = String::new();
    for ws in [&mut a, &mut b, &mut c] {
        send(ws, json!({"type": "join_group", "payload": {"groupName": "team"}})).await;
        let ack = recv(ws).await;
        assert_eq!(ack["type"], "ack");
        gid = ack["payload"]["groupId"].as_str().unwrap().to_string();
    }

    send(
        &mut a,
        json!({"type": "broadcast", "payload": {"groupId": gid, "message": {"text": "hello"}}}),
    )
    .await;
    for ws in [&mut b, &mut c] {
        let frame = recv(ws).await;
        assert_eq!(frame["type"], "broadcast");
        assert_eq!(frame["nodeId"], a_id.as_str());
        assert_eq!(frame["groupId"], gid.as_str());
        assert_eq!(frame["payload"]["text"], "hello");
    }

    // The sender gets nothing back; its next frame is the pong.
    send(&mut a, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut a).await["type"], "pong");

    let s = stats(&gw).await;
    assert_eq!(s["nodes"]["totalNodes"], 3);
    assert_eq!(s["groups"]["totalGroups"], 1);
    assert_eq!(s["groups"]["totalMemberships"], 3);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn direct_messages_and_missing_targets() {
    let gw = start(test_config()).await;
    let mut a = connect(&gw).await;
    let mut b = connect(&gw).await;
    let a_id = register(&mut a, "A").await;
    let b_id = register(&mut b, "B").await;

    send(
        &mut a,
        json!({"type": "direct", "payload": {"targetNodeId": b_id, "message": "psst"}}),
    )
    .await;
    let frame = recv(&mut b).await;
    assert_eq!(frame["type"], "direct");
    assert_eq!(frame["nodeId"], a_id.as_str());
    assert_eq!(frame["targetNodeId"], b_id.as_str());
    assert_eq!(frame["payload"], "psst");

    send(
        &mut a,
        json!({"type": "direct", "payload": {"targetNodeId": "no-such-node", "message": 1}}),
    )
    .await;
    let err = recv(&mut a).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "NODE_NOT_FOUND");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_cleans_up_membership() {
    let gw = start(test_config()).await;
    let mut a = connect(&gw).await;
    register(&mut a, "A").await;
    send(&mut a, json!({"type": "join_group", "payload": {"groupName": "g"}})).await;
    recv(&mut a).await;

    a.close(None).await.unwrap();
    drop(a);

    let mut cleaned = false;
    for _ in 0..50 {
        let s = stats(&gw).await;
        if s["nodes"]["totalNodes"] == 0 {
            assert_eq!(s["groups"]["totalMemberships"], 0);
            // Empty groups are kept.
            assert_eq!(s["groups"]["totalGroups"], 1);
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "node was not removed after disconnect");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn bad_token_closes_connection() {
    let gw = start(GatewayConfig {
        require_auth: true,
        auth_token: Some("correct-horse-battery".into()),
        ..test_config()
    })
    .await;

    let mut ws = connect(&gw).await;
    send(&mut ws, json!({"type": "register", "payload": {"name": "x", "token": "nope"}})).await;
    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["code"], "AUTH_FAILED");
    assert_eq!(close_code(&mut ws).await, Some(1008));

    let mut ok = connect(&gw).await;
    send(
        &mut ok,
        json!({"type": "register", "payload": {"name": "y", "token": "correct-horse-battery"}}),
    )
    .await;
    assert_eq!(recv(&mut ok).await["type"], "ack");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_frames_keep_connection_open() {
    let gw = start(test_config()).await;
    let mut ws = connect(&gw).await;
    ws.send(Message::text("this is not json")).await.unwrap();
    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["code"], "INVALID_MESSAGE");

    send(&mut ws, json!({"type": "teleport"})).await;
    let err = recv(&mut ws).await;
    assert_eq!(err["payload"]["code"], "INVALID_MESSAGE");

    register(&mut ws, "still-here").await;
    gw.stop().await.unwrap();
}

#[tokio::test]
async fn silent_nodes_are_evicted() {
    let gw = start(GatewayConfig {
        ping_interval_ms: 50,
        ping_timeout_ms: 200,
        ..test_config()
    })
    .await;

    let mut silent = connect(&gw).await;
    let silent_id = register(&mut silent, "silent").await;
    send(&mut silent, json!({"type": "join_group", "payload": {"groupName": "g"}})).await;
    recv(&mut silent).await;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut other = connect(&gw).await;
    register(&mut other, "other").await;
    send(
        &mut other,
        json!({"type": "direct", "payload": {"targetNodeId": silent_id, "message": 1}}),
    )
    .await;
    let err = recv(&mut other).await;
    assert_eq!(err["payload"]["code"], "NODE_NOT_FOUND");

    let s = stats(&gw).await;
    assert_eq!(s["groups"]["totalMemberships"], 0);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn bridge_round_trip_with_websocket_peer() {
    let gw = start(test_config()).await;
    let client = reqwest::Client::new();

    let reg: Value = client
        .post(http(&gw, "/bridge/send"))
        .body(json!({"type": "register", "payload": {"name": "poller"}}).to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reg["type"], "registered");
    let bridge_id = reg["nodeId"].as_str().unwrap().to_string();

    // Empty mailbox: the poll waits out the timeout and returns [].
    let start = std::time::Instant::now();
    let empty: Vec<Value> = client
        .get(http(&gw, "/bridge/poll"))
        .header("X-Node-ID", &bridge_id)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(empty.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(250));

    // A WebSocket node messages the bridge node.
    let mut ws = connect(&gw).await;
    let ws_id = register(&mut ws, "socket").await;
    send(
        &mut ws,
        json!({"type": "direct", "payload": {"targetNodeId": bridge_id, "message": "to-bridge"}}),
    )
    .await;

    let got: Vec<Value> = client
        .get(http(&gw, "/bridge/poll"))
        .header("X-Node-ID", &bridge_id)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["type"], "direct");
    assert_eq!(got[0]["nodeId"], ws_id.as_str());
    assert_eq!(got[0]["payload"], "to-bridge");

    // And back the other way.
    let replies: Vec<Value> = client
        .post(http(&gw, "/bridge/send"))
        .body(
            json!({
                "type": "direct",
                "nodeId": bridge_id,
                "payload": {"targetNodeId": ws_id, "message": "to-socket"}
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(replies.is_empty());
    let frame = recv(&mut ws).await;
    assert_eq!(frame["type"], "direct");
    assert_eq!(frame["nodeId"], bridge_id.as_str());

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn bridge_rejects_unknown_callers() {
    let gw = start(test_config()).await;
    let client = reqwest::Client::new();

    let resp = client.get(http(&gw, "/bridge/poll")).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(http(&gw, "/bridge/poll"))
        .header("X-Node-ID", "ghost")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(http(&gw, "/bridge/send"))
        .body(json!({"type": "ping"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(http(&gw, "/bridge/send"))
        .body("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_MESSAGE");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn health_reports_counts() {
    let gw = start(test_config()).await;
    let mut ws = connect(&gw).await;
    register(&mut ws, "A").await;

    let health: Value = reqwest::get(http(&gw, "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["stats"]["nodes"]["totalNodes"], 1);
    assert!(health["timestamp"].as_u64().unwrap() > 0);

    let s = stats(&gw).await;
    assert_eq!(s["gateway"]["requireAuth"], false);
    assert_eq!(s["gateway"]["maxNodes"], 1000);
    assert_eq!(s["gateway"]["transport"], "websocket");
    assert_eq!(s["gateway"]["transports"], json!(["websocket", "http-bridge"]));

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_open_sockets() {
    let gw = start(test_config()).await;
    let mut ws = connect(&gw).await;
    register(&mut ws, "A").await;

    gw.stop().await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {},
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn second_node_over_capacity_is_refused_and_closed() {
    let gw = start(GatewayConfig {
        max_nodes: 1,
        ..test_config()
    })
    .await;

    let mut alice = connect(&gw).await;
    register(&mut alice, "alice").await;

    let mut bob = connect(&gw).await;
    send(&mut bob, json!({"type": "register", "payload": {"name": "bob"}})).await;
    let err = recv(&mut bob).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "MAX_NODES_REACHED");
    assert_eq!(close_code(&mut bob).await, Some(1008));

    // The first node is unaffected.
    send(&mut alice, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut alice).await["type"], "pong");
    assert_eq!(stats(&gw).await["nodes"]["totalNodes"], 1);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn bridge_node_receives_group_broadcasts() {
    let gw = start(test_config()).await;
    let client = reqwest::Client::new();

    let reg = bridge_send(&client, &gw, json!({"type": "register", "payload": {"name": "poller"}})).await;
    let bridge_id = reg["nodeId"].as_str().unwrap().to_string();

    let replies = bridge_send(
        &client,
        &gw,
        json!({"type": "join_group", "nodeId": bridge_id, "payload": {"groupName": "news"}}),
    )
    .await;
    assert_eq!(replies[0]["type"], "ack");
    let gid = replies[0]["payload"]["groupId"].as_str().unwrap().to_string();

    let mut ws = connect(&gw).await;
    let ws_id = register(&mut ws, "socket").await;
    send(&mut ws, json!({"type": "join_group", "payload": {"groupId": gid}})).await;
    assert_eq!(recv(&mut ws).await["type"], "ack");
    send(
        &mut ws,
        json!({"type": "broadcast", "payload": {"groupId": gid, "message": {"text": "extra"}}}),
    )
    .await;

    let got: Vec<Value> = bridge_poll(&client, &gw, &bridge_id)
        .await
        .into_iter()
        .filter(|m| m["type"] != "ping")
        .collect();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["type"], "broadcast");
    assert_eq!(got[0]["nodeId"], ws_id.as_str());
    assert_eq!(got[0]["groupId"], gid.as_str());
    assert_eq!(got[0]["payload"]["text"], "extra");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_pings_reach_bridge_polls() {
    let gw = start(GatewayConfig {
        ping_interval_ms: 50,
        ping_timeout_ms: 10_000,
        bridge: BridgeConfig {
            poll_timeout_ms: 5_000,
            mailbox_capacity: 100,
        },
        ..test_config()
    })
    .await;
    let client = reqwest::Client::new();

    let reg = bridge_send(&client, &gw, json!({"type": "register", "payload": {"name": "poller"}})).await;
    let bridge_id = reg["nodeId"].as_str().unwrap().to_string();

    let start = std::time::Instant::now();
    let got = bridge_poll(&client, &gw, &bridge_id).await;
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(!got.is_empty());
    assert!(got.iter().all(|m| m["type"] == "ping"));

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn stop_releases_pending_poll() {
    let gw = start(GatewayConfig {
        bridge: BridgeConfig {
            poll_timeout_ms: 30_000,
            mailbox_capacity: 100,
        },
        ..test_config()
    })
    .await;
    let client = reqwest::Client::new();

    let reg = bridge_send(&client, &gw, json!({"type": "register", "payload": {"name": "poller"}})).await;
    let bridge_id = reg["nodeId"].as_str().unwrap().to_string();

    let url = http(&gw, "/bridge/poll");
    let poll = tokio::spawn({
        let client = client.clone();
        let bridge_id = bridge_id.clone();
        async move {
            let start = std::time::Instant::now();
            let body: Vec<Value> = client
                .get(url)
                .header("X-Node-ID", bridge_id)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            (body, start.elapsed())
        }
    });

    // Wait until the poll is parked on the mailbox.
    let mut parked = false;
    for _ in 0..100 {
        let nodes = gw.state().nodes.read().await;
        if nodes
            .get(&bridge_id)
            .and_then(|n| n.sink.mailbox())
            .is_some_and(|m| m.has_waiter())
        {
            parked = true;
            break;
        }
        drop(nodes);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(parked, "poll never started waiting");

    gw.stop().await.unwrap();

    let (body, elapsed) = tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .unwrap()
        .unwrap();
    assert!(body.is_empty());
    assert!(elapsed < Duration::from_secs(10));
}
