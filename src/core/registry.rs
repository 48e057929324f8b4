//! Connection registry
//!
//! Owns the set of live connections, indexed by connection id and by user.
//! All mutation goes through the single write lock; reads take snapshots and
//! never iterate shared state while it can change underneath them. Transport
//! I/O (close frames) always happens after the lock is released.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::constants::{CLOSE_POLICY_VIOLATION, CLOSE_SERVER_SHUTDOWN};
use crate::core::connection::Connection;
use crate::core::transport::Transport;
use crate::error::Result;

#[derive(Default)]
struct RegistryInner {
    /// connection_id -> connection
    connections: HashMap<String, Arc<Connection>>,
    /// user_id -> connection ids in admission order (oldest first)
    user_connections: HashMap<String, Vec<String>>,
}

pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    max_connections_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections_per_user: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_connections_per_user,
        }
    }

    /// Admit a new connection for a user, evicting the user's oldest
    /// connection first when the per-user cap is reached.
    pub async fn connect(
        &self,
        user_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Connection>> {
        // Close-then-admit: pop the oldest entry under the lock, close it
        // with the lock released, then insert the newcomer.
        let evicted = {
            let mut inner = self.inner.write().await;
            let at_cap = inner
                .user_connections
                .get(user_id)
                .map(|ids| ids.len() >= self.max_connections_per_user)
                .unwrap_or(false);
            if at_cap {
                Self::remove_oldest_locked(&mut inner, user_id)
            } else {
                None
            }
        };

        if let Some(old) = evicted {
            warn!(
                "Connection limit reached for user {}; evicting {}",
                user_id, old.id
            );
            old.mark_closing();
            if let Err(e) = old
                .transport
                .close(CLOSE_POLICY_VIOLATION, "Connection limit exceeded")
                .await
            {
                // The evicted socket is already gone from the maps; a close
                // failure just means the peer is unreachable.
                debug!("Eviction close failed for {}: {}", old.id, e);
            }
        }

        let connection = Arc::new(Connection::new(user_id, transport));
        {
            let mut inner = self.inner.write().await;
            inner
                .connections
                .insert(connection.id.clone(), connection.clone());
            inner
                .user_connections
                .entry(user_id.to_string())
                .or_default()
                .push(connection.id.clone());
        }

        info!("Connection {} admitted for user {}", connection.id, user_id);
        Ok(connection)
    }

    fn remove_oldest_locked(inner: &mut RegistryInner, user_id: &str) -> Option<Arc<Connection>> {
        let oldest_id = inner.user_connections.get_mut(user_id).and_then(|ids| {
            if ids.is_empty() {
                None
            } else {
                Some(ids.remove(0))
            }
        })?;
        if inner
            .user_connections
            .get(user_id)
            .map(|ids| ids.is_empty())
            .unwrap_or(false)
        {
            inner.user_connections.remove(user_id);
        }
        inner.connections.remove(&oldest_id)
    }

    fn remove_entry_locked(inner: &mut RegistryInner, connection_id: &str) -> Option<Arc<Connection>> {
        let connection = inner.connections.remove(connection_id)?;
        if let Some(ids) = inner.user_connections.get_mut(&connection.user_id) {
            ids.retain(|id| id != connection_id);
            if ids.is_empty() {
                inner.user_connections.remove(&connection.user_id);
            }
        }
        Some(connection)
    }

    /// Disconnect by (user, transport identity). A connection that is already
    /// gone is a no-op, not an error.
    pub async fn disconnect(
        &self,
        user_id: &str,
        transport: &Arc<dyn Transport>,
        code: u16,
        reason: &str,
    ) {
        let found = {
            let inner = self.inner.read().await;
            inner
                .user_connections
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id))
                .find(|conn| Arc::ptr_eq(&conn.transport, transport))
                .map(|conn| conn.id.clone())
        };

        if let Some(connection_id) = found {
            self.disconnect_by_id(&connection_id, code, reason).await;
        }
    }

    /// Disconnect by connection id; idempotent.
    pub async fn disconnect_by_id(&self, connection_id: &str, code: u16, reason: &str) {
        let removed = {
            let mut inner = self.inner.write().await;
            Self::remove_entry_locked(&mut inner, connection_id)
        };

        if let Some(connection) = removed {
            connection.mark_closing();
            if let Err(e) = connection.transport.close(code, reason).await {
                // Best-effort: the peer may already be gone.
                debug!("Close failed for {}: {}", connection.id, e);
            }
            info!(
                "Connection {} for user {} removed ({} {})",
                connection.id, connection.user_id, code, reason
            );
        }
    }

    /// Snapshot of a user's connections, oldest first
    pub async fn get_user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .user_connections
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub async fn get_by_id(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().await.connections.get(connection_id).cloned()
    }

    /// Snapshot of every tracked connection
    pub async fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Snapshot of every tracked connection id
    pub async fn all_connection_ids(&self) -> Vec<String> {
        self.inner.read().await.connections.keys().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .user_connections
            .get(user_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Remove every connection whose transport is no longer alive.
    /// Returns the ids that were swept so callers can release per-connection
    /// resources (heartbeats, batch queues, room membership).
    pub async fn cleanup_dead(&self) -> Vec<String> {
        let dead_ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .filter(|conn| !conn.is_alive())
                .map(|conn| conn.id.clone())
                .collect()
        };

        if dead_ids.is_empty() {
            return dead_ids;
        }

        {
            let mut inner = self.inner.write().await;
            for id in &dead_ids {
                Self::remove_entry_locked(&mut inner, id);
            }
        }
        info!("Swept {} dead connections", dead_ids.len());
        dead_ids
    }

    /// Close every connection with 1001 and clear all state
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut inner = self.inner.write().await;
            inner.user_connections.clear();
            inner.connections.drain().map(|(_, conn)| conn).collect()
        };

        for connection in drained {
            connection.mark_closing();
            if let Err(e) = connection
                .transport
                .close(CLOSE_SERVER_SHUTDOWN, "Server shutdown")
                .await
            {
                debug!("Shutdown close failed for {}: {}", connection.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::MockTransport;

    fn registry(cap: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(cap)
    }

    #[tokio::test]
    async fn test_connect_respects_per_user_cap() {
        let registry = registry(2);

        for _ in 0..4 {
            let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
            registry.connect("user1", transport).await.unwrap();
            assert!(registry.user_connection_count("user1").await <= 2);
        }
        assert_eq!(registry.user_connection_count("user1").await, 2);
    }

    #[tokio::test]
    async fn test_eviction_closes_oldest_with_policy_violation() {
        let registry = registry(2);

        let first = Arc::new(MockTransport::new());
        let first_dyn: Arc<dyn Transport> = first.clone();
        let oldest = registry.connect("user1", first_dyn).await.unwrap();

        registry
            .connect("user1", Arc::new(MockTransport::new()))
            .await
            .unwrap();
        registry
            .connect("user1", Arc::new(MockTransport::new()))
            .await
            .unwrap();

        let closes = first.close_frames();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, CLOSE_POLICY_VIOLATION);
        assert_eq!(closes[0].1, "Connection limit exceeded");
        assert!(registry.get_by_id(&oldest.id).await.is_none());
        assert_eq!(registry.user_connection_count("user1").await, 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = registry(5);
        let transport = Arc::new(MockTransport::new());
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        registry.connect("user1", transport_dyn.clone()).await.unwrap();

        registry.disconnect("user1", &transport_dyn, 1000, "done").await;
        assert_eq!(registry.connection_count().await, 0);

        // Second disconnect finds nothing and must not close again
        registry.disconnect("user1", &transport_dyn, 1000, "done").await;
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(transport.close_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_dead_removes_only_dead() {
        let registry = registry(5);

        let alive = Arc::new(MockTransport::new());
        let dead = Arc::new(MockTransport::new());
        let alive_dyn: Arc<dyn Transport> = alive.clone();
        let dead_dyn: Arc<dyn Transport> = dead.clone();

        let alive_conn = registry.connect("user1", alive_dyn).await.unwrap();
        let dead_conn = registry.connect("user2", dead_dyn).await.unwrap();

        dead.set_connected(false);
        let swept = registry.cleanup_dead().await;

        assert_eq!(swept, vec![dead_conn.id.clone()]);
        assert!(registry.get_by_id(&alive_conn.id).await.is_some());
        assert!(registry.get_by_id(&dead_conn.id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_with_going_away() {
        let registry = registry(5);
        let transports: Vec<Arc<MockTransport>> =
            (0..3).map(|_| Arc::new(MockTransport::new())).collect();

        for (i, transport) in transports.iter().enumerate() {
            let dyn_transport: Arc<dyn Transport> = transport.clone();
            registry
                .connect(&format!("user{}", i), dyn_transport)
                .await
                .unwrap();
        }

        registry.shutdown().await;
        assert_eq!(registry.connection_count().await, 0);
        for transport in transports {
            let closes = transport.close_frames();
            assert_eq!(closes.len(), 1);
            assert_eq!(closes[0].0, CLOSE_SERVER_SHUTDOWN);
            assert_eq!(closes[0].1, "Server shutdown");
        }
    }
}
