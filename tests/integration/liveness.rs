// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send
)]

//! Liveness reaper tests against a real server with short staleness
//! windows: silent sessions are evicted with a single offline broadcast,
//! and heartbeats keep a session alive across sweeps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beacon_relay::reaper;
use beacon_relay::relay::{self, RelayState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const SWEEP_INTERVAL: Duration = Duration::from_millis(150);
const SESSION_TIMEOUT: Duration = Duration::from_millis(400);

/// Starts a server with a fast reaper for testing.
async fn start_server_with_reaper() -> SocketAddr {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    let _reaper = reaper::spawn(state, SWEEP_INTERVAL, SESSION_TIMEOUT);
    addr
}

async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
    ws
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

async fn register(ws: &mut WsStream, user_id: &str) {
    send_json(ws, &json!({"type": "register", "userId": user_id})).await;
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "registered");
}

#[tokio::test]
async fn idle_session_is_reaped_with_single_offline_broadcast() {
    let addr = start_server_with_reaper().await;

    let mut alice = connect(addr).await;
    register(&mut alice, "alice").await;
    let mut bob = connect(addr).await;
    register(&mut bob, "bob").await;
    let _bob_online = recv_json(&mut alice).await;

    // Alice keeps pinging while bob stays silent past the timeout; wait
    // for bob's offline broadcast to arrive between pongs.
    let mut saw_offline = false;
    for _ in 0..20 {
        send_json(&mut alice, &json!({"type": "ping"})).await;
        let frame = recv_json(&mut alice).await;
        if frame["type"] == "user-status" {
            assert_eq!(frame["userId"], "bob");
            assert_eq!(frame["isOnline"], false);
            saw_offline = true;
            break;
        }
        assert_eq!(frame["type"], "pong");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(saw_offline, "reaper never evicted the idle session");

    // Bob's transport was force-closed.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), bob.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    // No further envelopes can reach bob.
    send_json(
        &mut alice,
        &json!({"type": "offer", "targetUserId": "bob", "payload": {}}),
    )
    .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "User bob is not online");
}

#[tokio::test]
async fn heartbeat_keeps_session_alive_across_sweeps() {
    let addr = start_server_with_reaper().await;

    let mut alice = connect(addr).await;
    register(&mut alice, "alice").await;

    // Ping through several full sweep intervals.
    for _ in 0..8 {
        send_json(&mut alice, &json!({"type": "ping"})).await;
        let frame = recv_json(&mut alice).await;
        assert_eq!(frame["type"], "pong", "session was evicted despite pings");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    // Still registered: another client can reach alice.
    let mut bob = connect(addr).await;
    register(&mut bob, "bob").await;
    send_json(
        &mut bob,
        &json!({"type": "offer", "targetUserId": "alice", "payload": {}}),
    )
    .await;
    // Alice receives bob's online broadcast, then the offer.
    let mut saw_offer = false;
    for _ in 0..4 {
        let frame = recv_json(&mut alice).await;
        if frame["type"] == "offer" {
            assert_eq!(frame["fromUserId"], "bob");
            saw_offer = true;
            break;
        }
    }
    assert!(saw_offer, "offer never reached the surviving session");
}
