//! Rate limiting module to prevent abuse
//!
//! The fixed-window limiter stores its counters on the connection itself, so
//! the window reset is computed lazily on access instead of by a background
//! timer per connection. The adaptive variant layers a per-connection
//! multiplier on top that is nudged up or down by promote/demote events.

use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::connection::Connection;

/// Multiplier bounds for adaptive limiting
const MULTIPLIER_FLOOR: f64 = 0.1;
const MULTIPLIER_CEILING: f64 = 10.0;
const PROMOTE_FACTOR: f64 = 1.2;
const PROMOTE_CAP: f64 = 2.0;
const DEMOTE_FACTOR: f64 = 0.8;

/// Point-in-time view of a connection's rate window
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub count: u32,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub remaining: u32,
}

impl RateLimitInfo {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "count": self.count,
            "max_requests": self.max_requests,
            "window_seconds": self.window_seconds,
            "remaining": self.remaining,
        })
    }
}

/// Fixed-window limiter: N requests per window, reset on expiry
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Check and count one request; true means the connection is limited
    pub fn is_rate_limited(&self, connection: &Connection) -> bool {
        connection.rate_check(self.max_requests, self.window)
    }

    /// Report the effective window state without consuming a request
    pub fn get_info(&self, connection: &Connection) -> RateLimitInfo {
        self.info_with_max(connection, self.max_requests)
    }

    fn info_with_max(&self, connection: &Connection, max_requests: u32) -> RateLimitInfo {
        let count = connection.rate_snapshot(self.window);
        RateLimitInfo {
            count,
            max_requests,
            window_seconds: self.window.as_secs(),
            remaining: max_requests.saturating_sub(count),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Adaptive limiter: scales the fixed-window cap per connection
pub struct AdaptiveRateLimiter {
    base: FixedWindowLimiter,
    multipliers: RwLock<HashMap<String, f64>>,
}

impl AdaptiveRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            base: FixedWindowLimiter::new(max_requests, window),
            multipliers: RwLock::new(HashMap::new()),
        }
    }

    async fn multiplier(&self, connection_id: &str) -> f64 {
        self.multipliers
            .read()
            .await
            .get(connection_id)
            .copied()
            .unwrap_or(1.0)
    }

    fn effective_max(&self, multiplier: f64) -> u32 {
        let clamped = multiplier.clamp(MULTIPLIER_FLOOR, MULTIPLIER_CEILING);
        ((self.base.max_requests() as f64 * clamped).floor() as u32).max(1)
    }

    /// Check and count one request against the scaled cap
    pub async fn is_rate_limited(&self, connection: &Connection) -> bool {
        let multiplier = self.multiplier(&connection.id).await;
        connection.rate_check(self.effective_max(multiplier), self.base.window())
    }

    /// Window state against the scaled cap, without consuming a request
    pub async fn get_info(&self, connection: &Connection) -> RateLimitInfo {
        let multiplier = self.multiplier(&connection.id).await;
        self.base
            .info_with_max(connection, self.effective_max(multiplier))
    }

    /// Reward a well-behaved connection with a higher cap
    pub async fn promote(&self, connection_id: &str) -> f64 {
        let mut multipliers = self.multipliers.write().await;
        let entry = multipliers.entry(connection_id.to_string()).or_insert(1.0);
        *entry = (*entry * PROMOTE_FACTOR).min(PROMOTE_CAP);
        *entry
    }

    /// Penalize a misbehaving connection with a lower cap
    pub async fn demote(&self, connection_id: &str) -> f64 {
        let mut multipliers = self.multipliers.write().await;
        let entry = multipliers.entry(connection_id.to_string()).or_insert(1.0);
        *entry = (*entry * DEMOTE_FACTOR).max(MULTIPLIER_FLOOR);
        *entry
    }

    /// Drop multipliers for connections that are no longer tracked
    pub async fn prune(&self, active_ids: &HashSet<String>) {
        let mut multipliers = self.multipliers.write().await;
        let before = multipliers.len();
        multipliers.retain(|id, _| active_ids.contains(id));
        let removed = before - multipliers.len();
        if removed > 0 {
            debug!("Pruned {} stale rate-limit multipliers", removed);
        }
    }

    pub async fn tracked_count(&self) -> usize {
        self.multipliers.read().await.len()
    }
}
