//! Narrow session-state interface used by the recovery path
//!
//! The relay only needs get/set/merge with optional TTL; anything richer
//! (Redis, Postgres) lives behind this trait in the host application.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{RelayError, Result};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a value by key, or None when absent/expired
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Object-merge `partial` into the stored value, creating it if missing
    async fn merge(&self, key: &str, partial: Value) -> Result<()>;
}

struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// In-memory session store for development and testing
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired entries; expiry is otherwise checked lazily on reads
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn merge(&self, key: &str, partial: Value) -> Result<()> {
        let partial_object = match partial {
            Value::Object(map) => map,
            other => {
                return Err(RelayError::StorageError(format!(
                    "merge requires a JSON object, got {}",
                    kind_name(&other)
                )));
            }
        };

        let mut entries = self.entries.write().await;
        match entries.get_mut(key).filter(|entry| !entry.is_expired()) {
            Some(entry) => {
                if let Value::Object(existing) = &mut entry.value {
                    for (field, value) in partial_object {
                        existing.insert(field, value);
                    }
                } else {
                    entry.value = Value::Object(partial_object);
                }
            }
            None => {
                entries.insert(
                    key.to_string(),
                    StoredEntry {
                        value: Value::Object(partial_object),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
