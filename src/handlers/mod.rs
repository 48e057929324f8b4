//! Request handlers for the relay's endpoints

pub mod websocket;

// Re-export the websocket handler
pub use websocket::handle_ws_client;
