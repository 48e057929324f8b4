use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::WebSocket;

use crate::constants::CLOSE_NORMAL;
use crate::core::manager::RelayManager;
use crate::core::transport::{Transport, WsTransport};

// Handle a WebSocket connection end to end: admit it, pump inbound frames
// through the router in arrival order, and tear down on exit.
pub async fn handle_ws_client(
    ws: WebSocket,
    user_id: Option<String>,
    manager: Arc<RelayManager>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    // Forward messages from our channel to the WebSocket sink
    tokio::task::spawn(async move {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                debug!("WebSocket sink closed: {}", e);
                break;
            }
        }
    });

    // Anonymous connections get a generated user id; authentication is the
    // host application's concern.
    let user_id = user_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(tx));

    let connection = match manager.connect(&user_id, transport).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to admit connection for user {}: {}", user_id, e);
            return;
        }
    };
    info!("Client connected: {} (user {})", connection.id, user_id);

    // Welcome frame so the client learns its connection id
    let connected = serde_json::json!({
        "type": "connected",
        "payload": {
            "connection_id": connection.id,
            "user_id": user_id,
        },
        "sender": "system",
    });
    if let Err(e) = manager.send_immediate(&connection.id, &connected).await {
        warn!("Failed to send welcome frame to {}: {}", connection.id, e);
    }

    // Inbound frames are processed sequentially so per-connection ordering
    // matches arrival order.
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_text() {
                    if let Ok(text) = msg.to_str() {
                        manager.handle_inbound(&connection, text).await;
                    }
                } else if msg.is_pong() {
                    manager.handle_pong(&connection);
                } else if msg.is_close() {
                    debug!("Close frame from {}", connection.id);
                    break;
                }
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", connection.id, e);
                break;
            }
        }
    }

    manager
        .disconnect(&connection.id, CLOSE_NORMAL, "client disconnected")
        .await;
    info!("Client disconnected: {}", connection.id);
}
