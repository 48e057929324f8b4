//! Unified relay manager
//!
//! Explicitly constructed façade that wires the registry, heartbeat monitor,
//! rooms, batcher, router and error handler together and owns their
//! lifecycle. The host application holds one instance and passes it by
//! reference; there is no process-wide singleton.

use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::core::batcher::{BatcherConfig, BatcherStats, MessageBatcher};
use crate::core::broadcast::{BroadcastOutcome, RoomManager};
use crate::core::connection::Connection;
use crate::core::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::core::message::OutboundMessage;
use crate::core::rate_limiter::AdaptiveRateLimiter;
use crate::core::recovery::{CircuitBreaker, ErrorHandler, ErrorStats};
use crate::core::registry::ConnectionRegistry;
use crate::core::router::{MessageHandler, MessageRouter, RouteOutcome, RouterStats};
use crate::core::transport::Transport;
use crate::core::validator::MessageValidator;
use crate::error::{RelayError, Result};
use crate::storage::session_store::SessionStore;

/// Aggregated telemetry snapshot
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub total_connects: u64,
    pub total_disconnects: u64,
    pub router: RouterStats,
    pub batcher: BatcherStats,
    pub errors: ErrorStats,
}

pub struct RelayManager {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    rooms: Arc<RoomManager>,
    batcher: Arc<MessageBatcher>,
    router: Arc<MessageRouter>,
    limiter: Arc<AdaptiveRateLimiter>,
    error_handler: Arc<ErrorHandler>,
    connect_breaker: CircuitBreaker,
    accepting: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl RelayManager {
    pub fn new(config: RelayConfig, session_store: Option<Arc<dyn SessionStore>>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections_per_user));
        let error_handler = Arc::new(ErrorHandler::new(
            config.error_history_limit,
            config.error_max_age,
            config.error_max_retries,
            session_store,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            HeartbeatConfig {
                interval: config.heartbeat_interval,
                timeout: config.heartbeat_timeout,
                max_missed: config.max_missed_heartbeats,
            },
            error_handler.clone(),
        ));
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let batcher = Arc::new(MessageBatcher::new(
            BatcherConfig {
                max_wait: config.batch_max_wait,
                max_batch_size: config.batch_max_size,
                min_batch_size: config.batch_min_size,
                max_batch_memory_kb: config.batch_max_memory_kb,
                priority_threshold: config.batch_priority_threshold,
                flush_on_high_priority: config.batch_flush_on_high_priority,
                max_send_retries: config.batch_max_send_retries,
                ..BatcherConfig::default()
            },
            registry.clone(),
            error_handler.clone(),
        ));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window,
        ));
        let validator = MessageValidator::with_default_schemas(
            config.max_message_size,
            config.max_text_length,
            config.allow_unknown_types,
        );
        let router = Arc::new(MessageRouter::new(
            validator,
            limiter.clone(),
            error_handler.clone(),
            CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_recovery_timeout,
            ),
            config.dispatch_timeout,
        ));
        let connect_breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout,
        );

        Arc::new(Self {
            config,
            registry,
            heartbeat,
            rooms,
            batcher,
            router,
            limiter,
            error_handler,
            connect_breaker,
            accepting: AtomicBool::new(true),
            maintenance: Mutex::new(None),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
        })
    }

    /// Launch the background maintenance loop: dead-connection sweep,
    /// rate-limit multiplier pruning and error-history purge.
    pub async fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.run_maintenance().await;
            }
        });
        let mut maintenance = self.maintenance.lock().await;
        if let Some(previous) = maintenance.replace(task) {
            previous.abort();
        }
        info!("Relay maintenance loop started");
    }

    /// Stop the maintenance loop; safe to call repeatedly
    pub async fn stop(&self) {
        if let Some(task) = self.maintenance.lock().await.take() {
            task.abort();
        }
    }

    async fn run_maintenance(&self) {
        let swept = self.registry.cleanup_dead().await;
        for connection_id in &swept {
            self.release_connection_resources(connection_id).await;
        }
        if !swept.is_empty() {
            debug!("Maintenance released {} dead connections", swept.len());
        }

        let active: HashSet<String> = self.registry.all_connection_ids().await.into_iter().collect();
        self.limiter.prune(&active).await;
        self.error_handler.purge_expired().await;
    }

    async fn release_connection_resources(&self, connection_id: &str) {
        self.heartbeat.stop(connection_id).await;
        self.batcher.drop_queue(connection_id).await;
        self.rooms.leave_all(connection_id).await;
    }

    /// Admit a connection for a user and begin monitoring it
    pub async fn connect(
        &self,
        user_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Connection>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RelayError::ConnectionFailure(
                "server is shutting down".to_string(),
            ));
        }
        if !self.connect_breaker.allow() {
            return Err(RelayError::CircuitOpen("connect".to_string()));
        }

        // Capture the eviction candidate so its heartbeat, batch queue and
        // room memberships can be released once the registry swaps it out.
        let eviction_candidate = if self.registry.user_connection_count(user_id).await
            >= self.config.max_connections_per_user
        {
            self.registry
                .get_user_connections(user_id)
                .await
                .first()
                .map(|conn| conn.id.clone())
        } else {
            None
        };

        match self.registry.connect(user_id, transport).await {
            Ok(connection) => {
                self.connect_breaker.record_success();
                if let Some(evicted_id) = eviction_candidate {
                    self.release_connection_resources(&evicted_id).await;
                }
                self.heartbeat.start(connection.clone()).await;
                self.connects.fetch_add(1, Ordering::Relaxed);
                Ok(connection)
            }
            Err(e) => {
                self.connect_breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Tear a connection down and release every per-connection resource.
    /// Disconnecting an unknown or already-removed connection is a no-op.
    pub async fn disconnect(&self, connection_id: &str, code: u16, reason: &str) {
        let known = self.registry.get_by_id(connection_id).await.is_some();

        self.heartbeat.stop(connection_id).await;
        if known {
            // Give queued messages one last chance before discarding
            if let Err(e) = self.batcher.flush(connection_id).await {
                debug!("Final flush for {} failed: {}", connection_id, e);
            }
        }
        self.batcher.drop_queue(connection_id).await;
        self.rooms.leave_all(connection_id).await;
        self.registry.disconnect_by_id(connection_id, code, reason).await;
        if known {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Route one inbound frame; invoked sequentially from each connection's
    /// read loop so per-connection processing stays in arrival order.
    pub async fn handle_inbound(&self, connection: &Arc<Connection>, raw: &str) -> RouteOutcome {
        self.router.process(connection, raw).await
    }

    /// Record a pong frame from the client
    pub fn handle_pong(&self, connection: &Connection) {
        self.heartbeat.handle_pong(connection);
    }

    /// Queue an outbound message for batched delivery
    pub async fn send_to_connection(
        self: &Arc<Self>,
        connection_id: &str,
        message: OutboundMessage,
        priority: i32,
    ) -> Result<()> {
        if self.registry.get_by_id(connection_id).await.is_none() {
            return Err(RelayError::ConnectionNotFound(connection_id.to_string()));
        }
        self.batcher.enqueue(connection_id, message, priority).await
    }

    /// Bypass the batcher for latency-sensitive frames
    pub async fn send_immediate(&self, connection_id: &str, message: &Value) -> Result<()> {
        let connection = self
            .registry
            .get_by_id(connection_id)
            .await
            .ok_or_else(|| RelayError::ConnectionNotFound(connection_id.to_string()))?;
        let serialized = serde_json::to_string(message)
            .map_err(|e| RelayError::MessageParseError(e.to_string()))?;
        connection.send_text(&serialized).await
    }

    pub async fn join_room(&self, connection_id: &str, room_id: &str) -> Result<()> {
        if self.registry.get_by_id(connection_id).await.is_none() {
            return Err(RelayError::ConnectionNotFound(connection_id.to_string()));
        }
        self.rooms.join(connection_id, room_id).await;
        Ok(())
    }

    pub async fn leave_room(&self, connection_id: &str, room_id: &str) {
        self.rooms.leave(connection_id, room_id).await;
    }

    pub async fn broadcast_to_room(&self, room_id: &str, message: &Value) -> BroadcastOutcome {
        self.rooms.broadcast_to_room(room_id, message).await
    }

    pub async fn broadcast_to_all(&self, message: &Value) -> BroadcastOutcome {
        self.rooms.broadcast_to_all(message).await
    }

    pub async fn broadcast_to_user(&self, user_id: &str, message: &Value) -> BroadcastOutcome {
        self.rooms.broadcast_to_user(user_id, message).await
    }

    /// Register the business handler for a message type
    pub async fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.router.register_handler(kind, handler).await;
    }

    pub async fn set_default_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.router.set_default_handler(handler).await;
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    /// Three-phase drain: stop intake, flush pending work under a bounded
    /// timeout, then force-close whatever remains.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Relay shutdown: stopping intake");
        self.accepting.store(false, Ordering::Release);
        self.stop().await;

        let drain = self.batcher.flush_all();
        match tokio::time::timeout(self.config.shutdown_drain_timeout, drain).await {
            Ok(remaining) if remaining > 0 => {
                warn!("Shutdown drain left {} messages undelivered", remaining)
            }
            Ok(_) => {}
            Err(_) => warn!("Shutdown drain timed out; forcing close"),
        }
        self.heartbeat.stop_all().await;

        self.registry.shutdown().await;
        self.rooms.clear().await;
        info!("Relay shutdown complete");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            active_connections: self.registry.connection_count().await,
            active_rooms: self.rooms.room_count().await,
            total_connects: self.connects.load(Ordering::Relaxed),
            total_disconnects: self.disconnects.load(Ordering::Relaxed),
            router: self.router.stats(),
            batcher: self.batcher.stats(),
            errors: self.error_handler.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLOSE_NORMAL;
    use crate::core::message::InboundMessage;
    use crate::core::transport::testing::MockTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, message: &InboundMessage, connection: &Arc<Connection>) -> Result<()> {
            let echo = json!({"type": "echo", "payload": message.payload});
            let serialized = serde_json::to_string(&echo)
                .map_err(|e| RelayError::MessageParseError(e.to_string()))?;
            connection.send_text(&serialized).await
        }
    }

    fn manager() -> Arc<RelayManager> {
        RelayManager::new(RelayConfig::for_testing(), None)
    }

    #[tokio::test]
    async fn test_connect_enforces_cap_and_releases_evicted() {
        let config = RelayConfig {
            max_connections_per_user: 2,
            ..RelayConfig::for_testing()
        };
        let manager = RelayManager::new(config, None);

        let first = Arc::new(MockTransport::new());
        let first_dyn: Arc<dyn Transport> = first.clone();
        let oldest = manager.connect("user1", first_dyn).await.unwrap();
        manager.join_room(&oldest.id, "job-1").await.unwrap();

        manager
            .connect("user1", Arc::new(MockTransport::new()))
            .await
            .unwrap();
        manager
            .connect("user1", Arc::new(MockTransport::new()))
            .await
            .unwrap();

        assert_eq!(manager.registry.user_connection_count("user1").await, 2);
        assert_eq!(first.close_frames()[0].0, 1008);
        // Evicted connection no longer occupies a room slot
        assert_eq!(manager.rooms.member_count("job-1").await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager();
        let connection = manager
            .connect("user1", Arc::new(MockTransport::new()))
            .await
            .unwrap();

        manager.disconnect(&connection.id, CLOSE_NORMAL, "bye").await;
        manager.disconnect(&connection.id, CLOSE_NORMAL, "bye").await;

        let stats = manager.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_disconnects, 1);
    }

    #[tokio::test]
    async fn test_inbound_roundtrip_through_router() {
        let manager = manager();
        manager.register_handler("user_message", Arc::new(EchoHandler)).await;

        let transport = Arc::new(MockTransport::new());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let connection = manager.connect("user1", dyn_transport).await.unwrap();

        let outcome = manager
            .handle_inbound(&connection, r#"{"type":"user_message","payload":{"text":"hi"}}"#)
            .await;
        assert_eq!(outcome, RouteOutcome::Completed);

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let echoed: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(echoed["payload"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_send_to_connection_batches() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let connection = manager.connect("user1", dyn_transport).await.unwrap();

        manager
            .send_to_connection(
                &connection.id,
                OutboundMessage::new("notice", json!({"n": 1})),
                1,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "batch");
        assert_eq!(frame["message_count"], 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_errors() {
        let manager = manager();
        let result = manager
            .send_to_connection("missing", OutboundMessage::new("x", json!({})), 1)
            .await;
        assert!(matches!(result, Err(RelayError::ConnectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_three_phase() {
        let manager = manager();
        manager.start().await;

        let transport = Arc::new(MockTransport::new());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let connection = manager.connect("user1", dyn_transport).await.unwrap();
        manager.join_room(&connection.id, "job-1").await.unwrap();
        manager
            .send_to_connection(
                &connection.id,
                OutboundMessage::new("notice", json!({"n": 1})),
                1,
            )
            .await
            .unwrap();

        manager.shutdown().await;

        // Intake refused, pending batch drained, sockets closed with 1001
        assert!(!manager.is_accepting());
        assert!(manager
            .connect("user2", Arc::new(MockTransport::new()))
            .await
            .is_err());
        let stats = manager.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert!(transport
            .close_frames()
            .iter()
            .any(|(code, _)| *code == 1001));
        let frames = transport.sent_frames();
        assert!(frames.iter().any(|f| f.contains("\"batch\"")));
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_dead_connections() {
        let manager = manager();
        manager.start().await;

        let transport = Arc::new(MockTransport::new());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let connection = manager.connect("user1", dyn_transport).await.unwrap();
        manager.join_room(&connection.id, "job-1").await.unwrap();

        transport.set_connected(false);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = manager.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        manager.stop().await;
    }
}
