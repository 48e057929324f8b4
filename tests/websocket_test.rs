//! End-to-end WebSocket tests against a live warp server

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rusty_relay::config::RelayConfig;
use rusty_relay::core::connection::Connection;
use rusty_relay::core::manager::RelayManager;
use rusty_relay::core::message::InboundMessage;
use rusty_relay::core::router::MessageHandler;
use rusty_relay::error::{RelayError, Result};
use rusty_relay::handlers::websocket::handle_ws_client;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use warp::Filter;

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &InboundMessage, connection: &Arc<Connection>) -> Result<()> {
        let echo = serde_json::json!({"type": "echo", "payload": message.payload});
        let serialized = serde_json::to_string(&echo)
            .map_err(|e| RelayError::MessageParseError(e.to_string()))?;
        connection.send_text(&serialized).await
    }
}

async fn spawn_server(manager: Arc<RelayManager>) -> SocketAddr {
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::any().map(move || manager.clone()))
        .map(
            |ws: warp::ws::Ws, query: HashMap<String, String>, manager: Arc<RelayManager>| {
                let user_id = query.get("user_id").cloned();
                ws.on_upgrade(move |socket| handle_ws_client(socket, user_id, manager))
            },
        );
    let (addr, server) = warp::serve(ws_route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let frame = socket
            .next()
            .await
            .expect("socket closed unexpectedly")
            .expect("websocket error");
        if frame.is_text() {
            return serde_json::from_str(frame.to_text().unwrap()).unwrap();
        }
    }
}

#[tokio::test]
async fn client_gets_welcome_then_echo() {
    let manager = RelayManager::new(RelayConfig::default(), None);
    manager.register_handler("user_message", Arc::new(EchoHandler)).await;
    let addr = spawn_server(manager.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws?user_id=alice", addr))
        .await
        .expect("connect failed");

    let welcome = next_json(&mut socket).await;
    assert_eq!(welcome["type"], "connected");
    assert_eq!(welcome["payload"]["user_id"], "alice");
    assert!(welcome["payload"]["connection_id"].is_string());
    assert_eq!(manager.stats().await.active_connections, 1);

    socket
        .send(Message::Text(
            r#"{"type":"user_message","payload":{"text":"hi"}}"#.to_string(),
        ))
        .await
        .unwrap();

    let echo = next_json(&mut socket).await;
    assert_eq!(echo["type"], "echo");
    assert_eq!(echo["payload"]["text"], "hi");

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn malformed_frame_gets_error_over_the_wire() {
    let manager = RelayManager::new(RelayConfig::default(), None);
    let addr = spawn_server(manager.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws?user_id=bob", addr))
        .await
        .expect("connect failed");
    let _welcome = next_json(&mut socket).await;

    socket
        .send(Message::Text("{not valid json".to_string()))
        .await
        .unwrap();

    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["error_code"], "INVALID_JSON");
    assert_eq!(error["sender"], "system");

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn disconnecting_client_is_unregistered() {
    let manager = RelayManager::new(RelayConfig::default(), None);
    let addr = spawn_server(manager.clone()).await;

    let (mut socket, _) = connect_async(format!("ws://{}/ws?user_id=carol", addr))
        .await
        .expect("connect failed");
    let _welcome = next_json(&mut socket).await;
    assert_eq!(manager.registry().connection_count().await, 1);

    socket.close(None).await.unwrap();
    drop(socket);

    // The server notices the close and tears the connection down
    for _ in 0..50 {
        if manager.registry().connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(manager.registry().connection_count().await, 0);
}
