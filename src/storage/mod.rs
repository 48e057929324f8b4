//! Storage interfaces consumed by the relay

pub mod session_store;

// Re-export the session store
pub use session_store::{MemorySessionStore, SessionStore};
