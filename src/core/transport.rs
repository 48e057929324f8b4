//! Transport abstraction over the underlying WebSocket channel
//!
//! The relay never touches warp types directly outside this module; every
//! component speaks to connections through the `Transport` trait so tests
//! can substitute in-memory fakes.

use async_trait::async_trait;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use warp::ws::Message as WsMessage;

use crate::error::{RelayError, Result};

/// One-way handle to a live client socket
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a text frame for delivery
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Queue a ping frame
    async fn send_ping(&self) -> Result<()>;

    /// Queue a close frame and mark the transport unusable
    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    /// Whether the underlying socket still reports an open state
    fn is_connected(&self) -> bool;
}

/// Transport backed by the mpsc channel feeding a warp WebSocket sink
pub struct WsTransport {
    sender: mpsc::UnboundedSender<WsMessage>,
    closed: AtomicBool,
}

impl WsTransport {
    pub fn new(sender: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            sender,
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, message: WsMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ConnectionClosed);
        }
        self.sender.send(message).map_err(|_| {
            self.closed.store(true, Ordering::Release);
            RelayError::ConnectionClosed
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.push(WsMessage::text(text))
    }

    async fn send_ping(&self) -> Result<()> {
        self.push(WsMessage::ping(Vec::new()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let result = self.push(WsMessage::close_with(code, reason.to_string()));
        self.closed.store(true, Ordering::Release);
        if let Err(ref e) = result {
            warn!("Failed to send close frame ({} {}): {}", code, reason, e);
        }
        result
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory transports shared by unit tests across core modules

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Records every frame and can be flipped into a failing/disconnected state
    pub struct MockTransport {
        pub sent: Mutex<Vec<String>>,
        pub pings: AtomicUsize,
        pub closes: Mutex<Vec<(u16, String)>>,
        pub connected: AtomicBool,
        pub fail_sends: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                pings: AtomicUsize::new(0),
                closes: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
            }
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn close_frames(&self) -> Vec<(u16, String)> {
            self.closes.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn ping_count(&self) -> usize {
            self.pings.load(Ordering::SeqCst)
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub fn set_failing(&self, failing: bool) {
            self.fail_sends.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: &str) -> Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(RelayError::ConnectionClosed);
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(RelayError::ConnectionFailure("mock send failure".to_string()));
            }
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(text.to_string());
            Ok(())
        }

        async fn send_ping(&self) -> Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(RelayError::ConnectionClosed);
            }
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self, code: u16, reason: &str) -> Result<()> {
            self.closes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((code, reason.to_string()));
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
