//! Server configuration module
//! Handles dynamic configuration parameters for the relay subsystem

use crate::constants::{DEFAULT_HOST, DEFAULT_PORT};
use crate::error::{RelayError, Result};
use std::env;
use std::time::Duration;

/// Relay configuration parameters
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum simultaneous connections per user before eviction kicks in
    pub max_connections_per_user: usize,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong before counting a miss
    pub heartbeat_timeout: Duration,
    /// Consecutive misses before a connection is declared dead
    pub max_missed_heartbeats: u32,
    /// Rate limit: requests allowed per window per connection
    pub rate_limit_max_requests: u32,
    /// Rate limit window duration
    pub rate_limit_window: Duration,
    /// Maximum serialized inbound message size in bytes
    pub max_message_size: usize,
    /// Maximum length of a single text field after sanitization
    pub max_text_length: usize,
    /// Whether unrecognized message types pass validation
    pub allow_unknown_types: bool,
    /// Business handler dispatch timeout
    pub dispatch_timeout: Duration,
    /// Batcher: oldest queued message age that forces a flush
    pub batch_max_wait: Duration,
    /// Batcher: queue length that forces a flush
    pub batch_max_size: usize,
    /// Batcher: lower bound for the adaptive batch size
    pub batch_min_size: usize,
    /// Batcher: accumulated payload size (KB) that forces a flush
    pub batch_max_memory_kb: usize,
    /// Batcher: priority at or above which a flush is forced
    pub batch_priority_threshold: i32,
    /// Batcher: whether high-priority messages force a flush
    pub batch_flush_on_high_priority: bool,
    /// Batcher: flush attempts before a batch is dropped
    pub batch_max_send_retries: u32,
    /// Error handler: bounded history length
    pub error_history_limit: usize,
    /// Error handler: records older than this are purged
    pub error_max_age: Duration,
    /// Error handler: default recovery attempts per record
    pub error_max_retries: u32,
    /// Circuit breaker: consecutive failures before opening
    pub breaker_failure_threshold: u32,
    /// Circuit breaker: cooldown before a half-open probe
    pub breaker_recovery_timeout: Duration,
    /// Background maintenance sweep interval
    pub maintenance_interval: Duration,
    /// Bounded wait for the shutdown drain phase
    pub shutdown_drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections_per_user: 5,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            rate_limit_max_requests: 60,
            rate_limit_window: Duration::from_secs(60),
            max_message_size: 64 * 1024,
            max_text_length: 4000,
            allow_unknown_types: false,
            dispatch_timeout: Duration::from_secs(10),
            batch_max_wait: Duration::from_millis(100),
            batch_max_size: 25,
            batch_min_size: 5,
            batch_max_memory_kb: 256,
            batch_priority_threshold: 8,
            batch_flush_on_high_priority: true,
            batch_max_send_retries: 3,
            error_history_limit: 1000,
            error_max_age: Duration::from_secs(3600),
            error_max_retries: 3,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            shutdown_drain_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Create a test configuration with short intervals
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(50),
            max_missed_heartbeats: 2,
            batch_max_wait: Duration::from_millis(20),
            maintenance_interval: Duration::from_millis(100),
            shutdown_drain_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env::var("RUSTY_RELAY_HOST").unwrap_or(defaults.host);
        let port = env::var("RUSTY_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);

        let max_connections_per_user = env::var("RUSTY_RELAY_MAX_CONN_PER_USER")
            .ok()
            .and_then(|c| c.parse().ok())
            .unwrap_or(defaults.max_connections_per_user);

        let heartbeat_interval = env_duration_secs("RUSTY_RELAY_HEARTBEAT_INTERVAL")
            .unwrap_or(defaults.heartbeat_interval);
        let heartbeat_timeout = env_duration_secs("RUSTY_RELAY_HEARTBEAT_TIMEOUT")
            .unwrap_or(defaults.heartbeat_timeout);
        let max_missed_heartbeats = env::var("RUSTY_RELAY_MAX_MISSED_HEARTBEATS")
            .ok()
            .and_then(|m| m.parse().ok())
            .unwrap_or(defaults.max_missed_heartbeats);

        let rate_limit_max_requests = env::var("RUSTY_RELAY_RATE_LIMIT_MAX")
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(defaults.rate_limit_max_requests);
        let rate_limit_window = env_duration_secs("RUSTY_RELAY_RATE_LIMIT_WINDOW")
            .unwrap_or(defaults.rate_limit_window);

        let max_message_size = env::var("RUSTY_RELAY_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_message_size);
        let max_text_length = env::var("RUSTY_RELAY_MAX_TEXT_LENGTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_text_length);
        let allow_unknown_types = env_bool("RUSTY_RELAY_ALLOW_UNKNOWN_TYPES")
            .unwrap_or(defaults.allow_unknown_types);

        let dispatch_timeout = env_duration_secs("RUSTY_RELAY_DISPATCH_TIMEOUT")
            .unwrap_or(defaults.dispatch_timeout);

        let batch_max_wait = env::var("RUSTY_RELAY_BATCH_MAX_WAIT_MS")
            .ok()
            .and_then(|w| w.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.batch_max_wait);
        let batch_max_size = env::var("RUSTY_RELAY_BATCH_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_max_size);
        let batch_min_size = env::var("RUSTY_RELAY_BATCH_MIN_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_min_size);
        let batch_max_memory_kb = env::var("RUSTY_RELAY_BATCH_MAX_MEMORY_KB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_max_memory_kb);
        let batch_priority_threshold = env::var("RUSTY_RELAY_BATCH_PRIORITY_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_priority_threshold);
        let batch_flush_on_high_priority = env_bool("RUSTY_RELAY_BATCH_FLUSH_HIGH_PRIORITY")
            .unwrap_or(defaults.batch_flush_on_high_priority);
        let batch_max_send_retries = env::var("RUSTY_RELAY_BATCH_MAX_SEND_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_max_send_retries);

        let error_history_limit = env::var("RUSTY_RELAY_ERROR_HISTORY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.error_history_limit);
        let error_max_age = env_duration_secs("RUSTY_RELAY_ERROR_MAX_AGE")
            .unwrap_or(defaults.error_max_age);
        let error_max_retries = env::var("RUSTY_RELAY_ERROR_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.error_max_retries);

        let breaker_failure_threshold = env::var("RUSTY_RELAY_BREAKER_FAILURES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.breaker_failure_threshold);
        let breaker_recovery_timeout = env_duration_secs("RUSTY_RELAY_BREAKER_RECOVERY")
            .unwrap_or(defaults.breaker_recovery_timeout);

        let maintenance_interval = env_duration_secs("RUSTY_RELAY_MAINTENANCE_INTERVAL")
            .unwrap_or(defaults.maintenance_interval);
        let shutdown_drain_timeout = env_duration_secs("RUSTY_RELAY_SHUTDOWN_DRAIN")
            .unwrap_or(defaults.shutdown_drain_timeout);

        let config = Self {
            host,
            port,
            max_connections_per_user,
            heartbeat_interval,
            heartbeat_timeout,
            max_missed_heartbeats,
            rate_limit_max_requests,
            rate_limit_window,
            max_message_size,
            max_text_length,
            allow_unknown_types,
            dispatch_timeout,
            batch_max_wait,
            batch_max_size,
            batch_min_size,
            batch_max_memory_kb,
            batch_priority_threshold,
            batch_flush_on_high_priority,
            batch_max_send_retries,
            error_history_limit,
            error_max_age,
            error_max_retries,
            breaker_failure_threshold,
            breaker_recovery_timeout,
            maintenance_interval,
            shutdown_drain_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break the relay at runtime
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_user == 0 {
            return Err(RelayError::ConfigError(
                "max_connections_per_user must be at least 1".to_string(),
            ));
        }
        if self.rate_limit_max_requests == 0 {
            return Err(RelayError::ConfigError(
                "rate_limit_max_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit_window.is_zero() {
            return Err(RelayError::ConfigError(
                "rate_limit_window must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(RelayError::ConfigError(
                "heartbeat interval and timeout must be non-zero".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(RelayError::ConfigError(
                "max_missed_heartbeats must be at least 1".to_string(),
            ));
        }
        if self.batch_max_size == 0 || self.batch_min_size == 0 {
            return Err(RelayError::ConfigError(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.batch_min_size > self.batch_max_size {
            return Err(RelayError::ConfigError(
                "batch_min_size must not exceed batch_max_size".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(RelayError::ConfigError(
                "max_message_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_duration_secs(key: &str) -> Option<Duration> {
    env::var(key).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| v.to_lowercase() == "true" || v == "1")
}
