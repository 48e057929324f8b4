//! Shared test helpers
#![allow(dead_code)]

use async_trait::async_trait;
use rusty_relay::core::transport::Transport;
use rusty_relay::error::{RelayError, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory transport that records every frame and can be flipped into a
/// failing or disconnected state.
pub struct TestTransport {
    sent: Mutex<Vec<String>>,
    pings: AtomicUsize,
    closes: Mutex<Vec<(u16, String)>>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
}

impl TestTransport {
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

impl Default for TestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RelayError::ConnectionFailure("test send failure".to_string()));
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
