//! End-to-end tests: real workers on ephemeral ports, driven over WebSocket.

use courier_core::memory::Seed;
use courier_core::{Collaborators, LocalBus, MemoryPresence, MemoryStore};
use courier_server::{AppState, Config, JwtVerifier};
use courier_protocol::RawUserId;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "e2e-secret";

const SEED: &str = r#"
[[users]]
id = 1
username = "alice"

[[users]]
id = 2
username = "bob"

[[users]]
id = 3
username = "carol"

[[channels]]
id = "chnl_general_chat"
members = [1, "2"]
"#;

struct Cluster {
    addrs: Vec<SocketAddr>,
    store: Arc<MemoryStore>,
}

async fn start_cluster(workers: usize) -> Cluster {
    let seed: Seed = toml::from_str(SEED).unwrap();
    let store = Arc::new(MemoryStore::from_seed(seed));
    let collaborators = Collaborators {
        directory: store.clone(),
        store: store.clone(),
        auth: Arc::new(JwtVerifier::new(SECRET)),
        presence: Arc::new(MemoryPresence::with_ttl(Duration::from_secs(90))),
        bus: Arc::new(LocalBus::new()),
    };

    let mut addrs = Vec::new();
    for index in 0..workers {
        let mut config = Config::default();
        config.metrics.enabled = false;
        let state = AppState::assemble(config, index, collaborators.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        tokio::spawn(courier_server::serve(listener, state));
    }

    Cluster { addrs, store }
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?{query}")).await.unwrap();
    ws
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Client, event: Value) {
    ws.send(Message::Text(event.to_string())).await.unwrap();
}

/// Connect and consume the `connected` / `channelsSynced` greeting.
async fn join(addr: SocketAddr, query: &str) -> (Client, Value) {
    let mut ws = connect(addr, query).await;
    let connected = next_event(&mut ws).await;
    assert_eq!(connected["event"], "connected");
    let synced = next_event(&mut ws).await;
    assert_eq!(synced["event"], "channelsSynced");
    (ws, synced)
}

#[tokio::test]
async fn test_handshake_greets_and_syncs_channels() {
    let cluster = start_cluster(1).await;
    let mut ws = connect(cluster.addrs[0], "userId=2").await;

    let connected = next_event(&mut ws).await;
    assert_eq!(connected["event"], "connected");
    assert_eq!(connected["data"]["userId"], "2");
    assert_eq!(connected["data"]["username"], "bob");

    let synced = next_event(&mut ws).await;
    assert_eq!(synced["data"]["channels"], json!(["chnl_general_chat"]));
}

#[tokio::test]
async fn test_unknown_user_is_refused() {
    let cluster = start_cluster(1).await;
    let mut ws = connect(cluster.addrs[0], "userId=999").await;

    let event = next_event(&mut ws).await;
    assert_eq!(event, json!({"event": "error", "data": "User not found"}));
}

#[tokio::test]
async fn test_token_cookie_handshake() {
    let cluster = start_cluster(1).await;
    let token = JwtVerifier::new(SECRET)
        .sign(&RawUserId::from(3), Duration::from_secs(60))
        .unwrap();

    let mut request = format!("ws://{}/ws", cluster.addrs[0])
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Cookie", format!("user={token}").parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let connected = next_event(&mut ws).await;
    assert_eq!(connected["data"]["username"], "carol");
}

#[tokio::test]
async fn test_channel_message_across_workers() {
    let cluster = start_cluster(2).await;
    let (mut alice, _) = join(cluster.addrs[0], "userId=1").await;
    let (mut bob, _) = join(cluster.addrs[1], "userId=2").await;

    send(
        &mut alice,
        json!({"event": "grpMessage", "data": {
            "channelId": "chnl_general_chat",
            "senderId": 1,
            "content": "hello team"
        }}),
    )
    .await;

    let sent = next_event(&mut alice).await;
    assert_eq!(sent["event"], "messageSent");
    assert_eq!(sent["data"]["success"], true);

    let delivered = next_event(&mut bob).await;
    assert_eq!(delivered["event"], "grpMessage");
    assert_eq!(delivered["data"]["content"], "hello team");
    assert_eq!(delivered["data"]["senderName"], "alice");
    assert_eq!(delivered["data"]["messageId"], sent["data"]["messageId"]);

    let notification = next_event(&mut bob).await;
    assert_eq!(notification["event"], "notification");
    assert_eq!(notification["data"]["type"], "message");

    assert_eq!(cluster.store.message_count(), 1);
}

#[tokio::test]
async fn test_direct_message_to_offline_user() {
    let cluster = start_cluster(1).await;
    let (mut alice, _) = join(cluster.addrs[0], "userId=1").await;

    send(
        &mut alice,
        json!({"event": "message", "data": {
            "senderId": "1",
            "receiverId": 3,
            "content": "are you there?"
        }}),
    )
    .await;

    let info = next_event(&mut alice).await;
    assert_eq!(info["event"], "info");
    let sent = next_event(&mut alice).await;
    assert_eq!(sent["event"], "messageSent");
    assert_eq!(cluster.store.message_count(), 1);
}

#[tokio::test]
async fn test_malformed_event_keeps_connection_open() {
    let cluster = start_cluster(1).await;
    let (mut alice, _) = join(cluster.addrs[0], "userId=1").await;

    alice.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(next_event(&mut alice).await["event"], "error");

    send(&mut alice, json!({"event": "ping", "data": {"timestamp": 5}})).await;
    let pong = next_event(&mut alice).await;
    assert_eq!(pong, json!({"event": "pong", "data": {"timestamp": 5}}));
}

#[tokio::test]
async fn test_health_endpoint() {
    let cluster = start_cluster(1).await;
    let (_alice, _) = join(cluster.addrs[0], "userId=1").await;

    let mut stream = TcpStream::connect(cluster.addrs[0]).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
}
