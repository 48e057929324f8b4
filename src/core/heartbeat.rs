//! Heartbeat monitoring
//!
//! One cooperative task per connection sends pings on an interval and judges
//! pong arrival against a timeout. After `max_missed` consecutive misses the
//! connection is declared dead and reported as a heartbeat timeout; actual
//! removal stays the registry's job via `cleanup_dead()`.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::connection::Connection;
use crate::core::recovery::{ErrorHandler, ErrorKind, ErrorRecord, ErrorSeverity};
use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            max_missed: 3,
        }
    }
}

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    error_handler: Arc<ErrorHandler>,
    tasks: Mutex<HashMap<String, MonitorHandle>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, error_handler: Arc<ErrorHandler>) -> Self {
        Self {
            config,
            error_handler,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Begin monitoring a connection. Starting twice for the same id replaces
    /// the previous monitor.
    pub async fn start(&self, connection: Arc<Connection>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let config = self.config.clone();
        let error_handler = self.error_handler.clone();
        let connection_id = connection.id.clone();

        let task = tokio::spawn(monitor_loop(connection, config, error_handler, cancel_rx));

        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(connection_id.clone(), MonitorHandle {
            cancel: cancel_tx,
            task,
        }) {
            let _ = previous.cancel.send(true);
            previous.task.abort();
            debug!("Replaced existing heartbeat monitor for {}", connection_id);
        }
    }

    /// Record a pong from the client
    pub fn handle_pong(&self, connection: &Connection) {
        connection.record_pong();
    }

    /// Stop monitoring; safe to call for an unknown id or repeatedly
    pub async fn stop(&self, connection_id: &str) {
        let handle = self.tasks.lock().await.remove(connection_id);
        if let Some(handle) = handle {
            // Cooperative: the loop observes the signal at its next sleep
            let _ = handle.cancel.send(true);
        }
    }

    /// Stop every monitor, used during shutdown
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            let _ = handle.cancel.send(true);
        }
    }

    pub async fn monitored_count(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.task.is_finished());
        tasks.len()
    }
}

async fn monitor_loop(
    connection: Arc<Connection>,
    config: HeartbeatConfig,
    error_handler: Arc<ErrorHandler>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut missed: u32 = 0;
    // Time of the oldest ping still waiting for a pong
    let mut pending_since: Option<Instant> = None;

    loop {
        if connection.is_closing() {
            return;
        }

        // Judge the outstanding ping before sending the next one
        if let Some(since) = pending_since {
            let answered = connection
                .last_pong()
                .map(|pong| pong >= since)
                .unwrap_or(false);
            if answered {
                missed = 0;
                pending_since = None;
            } else if since.elapsed() >= config.timeout {
                missed += 1;
                pending_since = None;
                debug!(
                    "Connection {} missed heartbeat ({}/{})",
                    connection.id, missed, config.max_missed
                );
                if missed >= config.max_missed {
                    connection.mark_closing();
                    info!(
                        "Connection {} declared dead after {} missed heartbeats",
                        connection.id, missed
                    );
                    let record = ErrorRecord::for_connection(
                        ErrorKind::HeartbeatTimeout,
                        format!("no pong after {} consecutive pings", missed),
                        &connection,
                    )
                    .with_severity(ErrorSeverity::High);
                    error_handler.handle(record, Some(&connection)).await;
                    return;
                }
            }
        }

        match connection.transport.send_ping().await {
            Ok(()) => {
                connection.record_ping();
                if pending_since.is_none() {
                    pending_since = Some(Instant::now());
                }
            }
            // The socket closing out from under us is normal churn
            Err(RelayError::ConnectionClosed) => {
                debug!("Heartbeat loop for {} ended: socket closed", connection.id);
                return;
            }
            Err(e) => {
                let record = ErrorRecord::for_connection(
                    ErrorKind::HeartbeatError,
                    format!("ping failed: {}", e),
                    &connection,
                );
                error_handler.handle(record, Some(&connection)).await;
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = cancel_rx.changed() => {
                debug!("Heartbeat monitor for {} cancelled", connection.id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::MockTransport;

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(20),
            max_missed: 2,
        }
    }

    fn error_handler() -> Arc<ErrorHandler> {
        Arc::new(ErrorHandler::new(100, Duration::from_secs(3600), 3, None))
    }

    #[tokio::test]
    async fn test_silent_connection_declared_dead() {
        let handler = error_handler();
        let monitor = HeartbeatMonitor::new(fast_config(), handler.clone());
        let transport = Arc::new(MockTransport::new());
        let connection = Arc::new(Connection::new("user1", transport.clone()));

        monitor.start(connection.clone()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!connection.is_alive());
        assert!(transport.ping_count() >= 2);
        let stats = handler.stats().await;
        assert_eq!(stats.by_kind.get("heartbeat_timeout"), Some(&1));
    }

    #[tokio::test]
    async fn test_ponging_connection_stays_alive() {
        let monitor = HeartbeatMonitor::new(fast_config(), error_handler());
        let transport = Arc::new(MockTransport::new());
        let connection = Arc::new(Connection::new("user1", transport.clone()));

        monitor.start(connection.clone()).await;

        // Answer every ping promptly
        let responder = connection.clone();
        let pong_task = tokio::spawn(async move {
            loop {
                responder.record_pong();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(connection.is_alive());

        pong_task.abort();
        monitor.stop(&connection.id).await;
    }

    #[tokio::test]
    async fn test_closed_socket_ends_loop_silently() {
        let handler = error_handler();
        let monitor = HeartbeatMonitor::new(fast_config(), handler.clone());
        let transport = Arc::new(MockTransport::new());
        let connection = Arc::new(Connection::new("user1", transport.clone()));

        transport.set_connected(false);
        monitor.start(connection.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Closure is not an escalated error
        assert_eq!(handler.stats().await.total, 0);
        assert_eq!(monitor.monitored_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let monitor = HeartbeatMonitor::new(fast_config(), error_handler());
        let transport = Arc::new(MockTransport::new());
        let connection = Arc::new(Connection::new("user1", transport));

        monitor.start(connection.clone()).await;
        monitor.stop(&connection.id).await;
        monitor.stop(&connection.id).await;
        monitor.stop("never-started").await;
        assert_eq!(monitored_after_settle(&monitor).await, 0);
    }

    async fn monitored_after_settle(monitor: &HeartbeatMonitor) -> usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.monitored_count().await
    }
}
