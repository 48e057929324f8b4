use async_trait::async_trait;
use log::{error, info, warn};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::{self, Filter};

use rusty_relay::config::RelayConfig;
use rusty_relay::constants::WS_PATH;
use rusty_relay::core::connection::Connection;
use rusty_relay::core::manager::RelayManager;
use rusty_relay::core::message::InboundMessage;
use rusty_relay::core::router::MessageHandler;
use rusty_relay::error::{RelayError, Result};
use rusty_relay::handlers::websocket::handle_ws_client;
use rusty_relay::storage::session_store::MemorySessionStore;

/// Fallback handler: acknowledge frames the host application has not
/// registered a business handler for.
struct AckHandler;

#[async_trait]
impl MessageHandler for AckHandler {
    async fn handle(&self, message: &InboundMessage, connection: &Arc<Connection>) -> Result<()> {
        let ack = serde_json::json!({
            "type": "ack",
            "payload": { "received": message.kind },
            "sender": "system",
        });
        let serialized = serde_json::to_string(&ack)
            .map_err(|e| RelayError::MessageParseError(e.to_string()))?;
        connection.send_text(&serialized).await
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init();

    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from the environment
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration: host={}, port={}", config.host, config.port);

    // Build the server address before the config moves into the manager
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    // Create the relay manager with an in-memory session store
    let manager = RelayManager::new(config, Some(Arc::new(MemorySessionStore::new())));
    manager.start().await;
    manager.set_default_handler(Arc::new(AckHandler)).await;

    // Create WebSocket route; the optional user_id query parameter stands in
    // for the host application's authentication layer
    let ws_route = warp::path(WS_PATH)
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_manager(manager.clone()))
        .map(
            |ws: warp::ws::Ws, query: HashMap<String, String>, manager: Arc<RelayManager>| {
                let user_id = query.get("user_id").cloned();
                ws.on_upgrade(move |socket| handle_ws_client(socket, user_id, manager))
            },
        );

    // Create health check route
    let health_route = warp::path("health").map(|| "OK");

    // Combine routes
    let routes = ws_route.or(health_route);

    info!("Starting Rusty Relay server on {}", addr);

    let (_bound, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    });
    server.await;

    // Drain connections and pending batches before exiting
    manager.shutdown().await;
}

// Helper function to include the manager in request handling
fn with_manager(
    manager: Arc<RelayManager>,
) -> impl Filter<Extract = (Arc<RelayManager>,), Error = Infallible> + Clone {
    warp::any().map(move || manager.clone())
}
