//! Core functionality for the relay subsystem

pub mod batcher;
pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod manager;
pub mod message;
pub mod rate_limiter;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod transport;
pub mod validator;

// Re-export main components for convenience
pub use broadcast::{BroadcastOutcome, RoomManager};
pub use connection::Connection;
pub use manager::{RelayManager, RelayStats};
pub use message::{BatchFrame, ErrorFrame, InboundMessage, OutboundMessage};
pub use registry::ConnectionRegistry;
pub use router::{MessageHandler, RouteOutcome};
pub use transport::{Transport, WsTransport};
