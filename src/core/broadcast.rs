//! Room membership and broadcast fan-out
//!
//! Rooms are named sets of connection ids created implicitly on first join.
//! Every broadcast path isolates per-recipient failures: one bad connection
//! must never abort delivery to the rest, so sends are attempted for every
//! recipient and the outcome reports counts instead of raising.

use log::{debug, error, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::constants::CLOSE_NORMAL;
use crate::core::registry::ConnectionRegistry;

/// Per-recipient tally for one broadcast call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

pub struct RoomManager {
    registry: Arc<ConnectionRegistry>,
    /// room_id -> member connection ids
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    /// connection_id -> room ids the connection joined
    member_rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoomManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            rooms: RwLock::new(HashMap::new()),
            member_rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection to a room, creating the room on first join.
    /// Both membership maps are updated under simultaneously held locks.
    pub async fn join(&self, connection_id: &str, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let mut member_rooms = self.member_rooms.write().await;

        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        member_rooms
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());
        debug!("Connection {} joined room {}", connection_id, room_id);
    }

    /// Remove a connection from a room; an empty room is dropped lazily
    pub async fn leave(&self, connection_id: &str, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let mut member_rooms = self.member_rooms.write().await;
        Self::leave_locked(&mut rooms, &mut member_rooms, connection_id, room_id);
    }

    fn leave_locked(
        rooms: &mut HashMap<String, HashSet<String>>,
        member_rooms: &mut HashMap<String, HashSet<String>>,
        connection_id: &str,
        room_id: &str,
    ) {
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
        if let Some(joined) = member_rooms.get_mut(connection_id) {
            joined.remove(room_id);
            if joined.is_empty() {
                member_rooms.remove(connection_id);
            }
        }
    }

    /// Remove a connection from every room it joined (e.g. on disconnect)
    pub async fn leave_all(&self, connection_id: &str) {
        let mut rooms = self.rooms.write().await;
        let mut member_rooms = self.member_rooms.write().await;

        let joined = member_rooms.remove(connection_id).unwrap_or_default();
        for room_id in joined {
            if let Some(members) = rooms.get_mut(&room_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    rooms.remove(&room_id);
                }
            }
        }
    }

    pub async fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.member_rooms
            .read()
            .await
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Drop all membership state, used during shutdown
    pub async fn clear(&self) {
        self.rooms.write().await.clear();
        self.member_rooms.write().await.clear();
    }

    /// Fan a message out to every member of a room
    pub async fn broadcast_to_room(&self, room_id: &str, message: &Value) -> BroadcastOutcome {
        let members = self.members(room_id).await;
        self.send_to_targets(members, message).await
    }

    /// Fan a message out to every tracked connection
    pub async fn broadcast_to_all(&self, message: &Value) -> BroadcastOutcome {
        let targets = self.registry.all_connection_ids().await;
        self.send_to_targets(targets, message).await
    }

    /// Fan a message out to every connection a user holds
    pub async fn broadcast_to_user(&self, user_id: &str, message: &Value) -> BroadcastOutcome {
        let targets: Vec<String> = self
            .registry
            .get_user_connections(user_id)
            .await
            .into_iter()
            .map(|conn| conn.id.clone())
            .collect();
        self.send_to_targets(targets, message).await
    }

    /// Attempt one send per target concurrently; a failed send on a dead
    /// transport evicts the target from rooms and registry, any other
    /// failure keeps it (the connection may recover).
    async fn send_to_targets(&self, targets: Vec<String>, message: &Value) -> BroadcastOutcome {
        let total = targets.len();
        if total == 0 {
            return BroadcastOutcome::default();
        }

        let serialized = match serde_json::to_string(message) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Broadcast serialization failed: {}", e);
                return BroadcastOutcome {
                    successful: 0,
                    failed: total,
                    total,
                };
            }
        };

        let mut send_tasks = Vec::with_capacity(total);
        for target in targets {
            let registry = self.registry.clone();
            let payload = serialized.clone();
            send_tasks.push(tokio::spawn(async move {
                match registry.get_by_id(&target).await {
                    Some(connection) => {
                        let sent = connection.send_text(&payload).await.is_ok();
                        (target, sent, connection.is_alive())
                    }
                    // Already unregistered; only room membership is left
                    None => (target, false, false),
                }
            }));
        }

        let results = futures_util::future::join_all(send_tasks).await;

        let mut outcome = BroadcastOutcome {
            successful: 0,
            failed: 0,
            total,
        };
        let mut dead: Vec<String> = Vec::new();
        for result in results {
            match result {
                Ok((target, sent, alive)) => {
                    if sent {
                        outcome.successful += 1;
                    } else {
                        outcome.failed += 1;
                        if !alive {
                            dead.push(target);
                        }
                    }
                }
                Err(e) => {
                    warn!("Broadcast send task panicked: {}", e);
                    outcome.failed += 1;
                }
            }
        }

        for target in dead {
            debug!("Evicting dead connection {} after failed broadcast", target);
            self.leave_all(&target).await;
            self.registry
                .disconnect_by_id(&target, CLOSE_NORMAL, "connection lost")
                .await;
        }

        outcome
    }
}
