//! Per-connection state
//! Handles the lifecycle bookkeeping for a single client session

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::transport::Transport;
use crate::error::Result;

/// Mutable bookkeeping guarded by a short-lived in-memory lock.
/// Network I/O never happens while this lock is held.
#[derive(Debug, Clone)]
struct ConnectionState {
    last_ping: Instant,
    last_pong: Option<Instant>,
    message_count: u64,
    error_count: u32,
    rate_window_start: Instant,
    rate_count: u32,
    closing: bool,
}

/// Represents the state of a single WebSocket connection
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub transport: Arc<dyn Transport>,
    pub connected_at: Instant,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a new connection with a unique ID
    pub fn new(user_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            transport,
            connected_at: now,
            state: Mutex::new(ConnectionState {
                last_ping: now,
                last_pong: None,
                message_count: 0,
                error_count: 0,
                rate_window_start: now,
                rate_count: 0,
                closing: false,
            }),
        }
    }

    // A poisoned state lock only means a panic mid-update elsewhere;
    // the plain-data guard is still usable, so recover it.
    fn state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a text frame through the underlying transport
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.transport.send_text(text).await
    }

    /// Record that a ping was sent to the client
    pub fn record_ping(&self) {
        self.state().last_ping = Instant::now();
    }

    /// Record a pong received from the client
    pub fn record_pong(&self) {
        self.state().last_pong = Some(Instant::now());
    }

    pub fn last_ping(&self) -> Instant {
        self.state().last_ping
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.state().last_pong
    }

    /// Count one processed inbound message
    pub fn bump_message_count(&self) -> u64 {
        let mut state = self.state();
        state.message_count += 1;
        state.message_count
    }

    pub fn message_count(&self) -> u64 {
        self.state().message_count
    }

    /// Count one error attributed to this connection
    pub fn bump_error_count(&self) -> u32 {
        let mut state = self.state();
        state.error_count += 1;
        state.error_count
    }

    pub fn error_count(&self) -> u32 {
        self.state().error_count
    }

    /// Fixed-window rate check: lazily resets the window, then either admits
    /// (incrementing the count) or reports the connection as limited.
    pub fn rate_check(&self, max_requests: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state();
        if now.duration_since(state.rate_window_start) >= window {
            state.rate_window_start = now;
            state.rate_count = 0;
        }
        if state.rate_count >= max_requests {
            return true;
        }
        state.rate_count += 1;
        false
    }

    /// Effective request count in the current window without mutating state.
    /// Reports zero once the window has elapsed.
    pub fn rate_snapshot(&self, window: Duration) -> u32 {
        let state = self.state();
        if state.rate_window_start.elapsed() >= window {
            0
        } else {
            state.rate_count
        }
    }

    /// Flag the connection as going away; a closing connection is no longer
    /// considered alive regardless of what the transport reports.
    pub fn mark_closing(&self) {
        self.state().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.state().closing
    }

    /// True iff the transport is open and the connection is not shutting down
    pub fn is_alive(&self) -> bool {
        !self.is_closing() && self.transport.is_connected()
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
