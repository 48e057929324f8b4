//! Error handling and recovery
//!
//! Every component files failures here as typed records. The handler keeps a
//! bounded history for diagnostics, per-connection and per-kind counters, and
//! attempts recovery for recoverable records — gated by an exponential
//! backoff per (kind, scope) so a flapping connection cannot spin the
//! recovery machinery.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use lru::LruCache;
use rand::Rng;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::connection::Connection;
use crate::storage::session_store::SessionStore;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Bounded number of connections whose error counts are tracked; the oldest
/// entries fall out first so churning connections cannot exhaust memory.
const MAX_TRACKED_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FormatError,
    ValidationError,
    SecurityError,
    RateLimitError,
    ConnectionError,
    HeartbeatError,
    HeartbeatTimeout,
    UnexpectedError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FormatError => "format_error",
            Self::ValidationError => "validation_error",
            Self::SecurityError => "security_error",
            Self::RateLimitError => "rate_limit_error",
            Self::ConnectionError => "connection_error",
            Self::HeartbeatError => "heartbeat_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            Self::FormatError | Self::ValidationError | Self::RateLimitError => ErrorSeverity::Low,
            Self::SecurityError => ErrorSeverity::Medium,
            Self::ConnectionError | Self::HeartbeatError => ErrorSeverity::Medium,
            Self::HeartbeatTimeout => ErrorSeverity::High,
            Self::UnexpectedError => ErrorSeverity::High,
        }
    }

    /// Whether a recovery attempt makes sense at all for this kind
    pub fn default_recoverable(&self) -> bool {
        match self {
            Self::FormatError | Self::ValidationError | Self::SecurityError => false,
            Self::RateLimitError => true,
            Self::ConnectionError => true,
            Self::HeartbeatError | Self::HeartbeatTimeout => true,
            Self::UnexpectedError => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error_id: String,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    recorded_at: Instant,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_id: Uuid::new_v4().to_string(),
            connection_id: None,
            user_id: None,
            kind,
            message: message.into(),
            severity: kind.default_severity(),
            timestamp: Utc::now(),
            recoverable: kind.default_recoverable(),
            retry_count: 0,
            // Zero means "use the handler's configured default"
            max_retries: 0,
            recorded_at: Instant::now(),
        }
    }

    pub fn for_connection(kind: ErrorKind, message: impl Into<String>, conn: &Connection) -> Self {
        let mut record = Self::new(kind, message);
        record.connection_id = Some(conn.id.clone());
        record.user_id = Some(conn.user_id.clone());
        record
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn age(&self) -> Duration {
        self.recorded_at.elapsed()
    }

    /// Backoff scope: the most specific identity available
    fn scope(&self) -> String {
        self.connection_id
            .clone()
            .or_else(|| self.user_id.clone())
            .unwrap_or_else(|| "global".to_string())
    }
}

struct BackoffState {
    next_attempt: Instant,
    delay: Duration,
}

/// Snapshot of handler counters for telemetry
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total: u64,
    pub recovered: u64,
    pub refused_by_backoff: u64,
    pub by_kind: HashMap<&'static str, u64>,
}

pub struct ErrorHandler {
    history: RwLock<VecDeque<ErrorRecord>>,
    history_limit: usize,
    max_age: Duration,
    max_retries: u32,
    connection_counts: Mutex<LruCache<String, u32>>,
    pattern_counts: RwLock<HashMap<&'static str, u64>>,
    backoff: Mutex<HashMap<(ErrorKind, String), BackoffState>>,
    session_store: Option<Arc<dyn SessionStore>>,
    total: AtomicU64,
    recovered: AtomicU64,
    refused_by_backoff: AtomicU64,
}

impl ErrorHandler {
    pub fn new(
        history_limit: usize,
        max_age: Duration,
        max_retries: u32,
        session_store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            history: RwLock::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            max_age,
            max_retries,
            connection_counts: Mutex::new(LruCache::new(capacity)),
            pattern_counts: RwLock::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            session_store,
            total: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            refused_by_backoff: AtomicU64::new(0),
        }
    }

    /// Record an error and, when it qualifies, attempt recovery.
    /// Returns whether the error was recovered.
    pub async fn handle(&self, mut record: ErrorRecord, conn: Option<&Arc<Connection>>) -> bool {
        if record.max_retries == 0 {
            record.max_retries = self.max_retries;
        }
        self.log_record(&record);
        self.track(&record, conn).await;

        if !record.recoverable || record.retry_count >= record.max_retries {
            return false;
        }

        if !self.backoff_permits(&record) {
            self.refused_by_backoff.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Recovery refused by backoff for {} on {}",
                record.kind.as_str(),
                record.scope()
            );
            return false;
        }

        let recovered = self.attempt_recovery(&record, conn).await;
        if recovered {
            self.recovered.fetch_add(1, Ordering::Relaxed);
            self.reset_backoff(&record);
            info!(
                "Recovered from {} on {}",
                record.kind.as_str(),
                record.scope()
            );
        }
        recovered
    }

    fn log_record(&self, record: &ErrorRecord) {
        let scope = record.scope();
        match record.severity {
            ErrorSeverity::Low => {
                debug!("[{}] {} ({})", record.kind.as_str(), record.message, scope)
            }
            ErrorSeverity::Medium => {
                warn!("[{}] {} ({})", record.kind.as_str(), record.message, scope)
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!("[{}] {} ({})", record.kind.as_str(), record.message, scope)
            }
        }
    }

    async fn track(&self, record: &ErrorRecord, conn: Option<&Arc<Connection>>) {
        self.total.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self.history.write().await;
            history.push_back(record.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        {
            let mut pattern_counts = self.pattern_counts.write().await;
            *pattern_counts.entry(record.kind.as_str()).or_insert(0) += 1;
        }

        if let Some(connection_id) = &record.connection_id {
            let mut counts = self
                .connection_counts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let next = counts.get(connection_id).copied().unwrap_or(0) + 1;
            counts.put(connection_id.clone(), next);
        }

        if let Some(conn) = conn {
            conn.bump_error_count();
        }
    }

    /// Consume a backoff slot for this record's (kind, scope); inside the
    /// window the attempt is refused outright, not queued.
    fn backoff_permits(&self, record: &ErrorRecord) -> bool {
        let key = (record.kind, record.scope());
        let now = Instant::now();
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        match backoff.get_mut(&key) {
            Some(state) if now < state.next_attempt => false,
            Some(state) => {
                let jitter = jitter_for(state.delay);
                state.next_attempt = now + state.delay + jitter;
                state.delay = (state.delay * 2).min(BACKOFF_CAP);
                true
            }
            None => {
                backoff.insert(
                    key,
                    BackoffState {
                        next_attempt: now + BACKOFF_INITIAL,
                        delay: BACKOFF_INITIAL * 2,
                    },
                );
                true
            }
        }
    }

    fn reset_backoff(&self, record: &ErrorRecord) {
        let key = (record.kind, record.scope());
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.remove(&key);
    }

    /// Typed recovery strategies; a direct call per kind, no indirection.
    async fn attempt_recovery(&self, record: &ErrorRecord, conn: Option<&Arc<Connection>>) -> bool {
        match record.kind {
            // A closed socket has no recovery path on the server side; the
            // client must reconnect. Persist enough state for it to resume.
            ErrorKind::ConnectionError => {
                if let (Some(store), Some(user_id)) = (&self.session_store, &record.user_id) {
                    let key = format!("recovery:{}", user_id);
                    let partial = json!({
                        "last_error": record.message,
                        "error_kind": record.kind.as_str(),
                        "disconnected_at": record.timestamp.to_rfc3339(),
                    });
                    if let Err(e) = store.merge(&key, partial).await {
                        warn!("Failed to persist recovery state for {}: {}", user_id, e);
                    }
                }
                false
            }
            // The window elapsing is the recovery; traffic simply resumes.
            ErrorKind::RateLimitError => true,
            ErrorKind::HeartbeatError | ErrorKind::HeartbeatTimeout => conn
                .map(|c| c.transport.is_connected())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Remove history entries older than the configured age
    pub async fn purge_expired(&self) -> usize {
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|record| record.age() <= self.max_age);
        let purged = before - history.len();
        if purged > 0 {
            debug!("Purged {} expired error records", purged);
        }
        purged
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn recent_for_connection(&self, connection_id: &str) -> Vec<ErrorRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|record| record.connection_id.as_deref() == Some(connection_id))
            .cloned()
            .collect()
    }

    pub fn connection_error_count(&self, connection_id: &str) -> u32 {
        let mut counts = self
            .connection_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        counts.get(connection_id).copied().unwrap_or(0)
    }

    pub async fn stats(&self) -> ErrorStats {
        ErrorStats {
            total: self.total.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            refused_by_backoff: self.refused_by_backoff.load(Ordering::Relaxed),
            by_kind: self.pattern_counts.read().await.clone(),
        }
    }
}

fn jitter_for(delay: Duration) -> Duration {
    let max_jitter_ms = (delay.as_millis() / 10).max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..max_jitter_ms))
}

/// Three-state guard that stops attempting an operation after repeated
/// failures and probes again after a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the guarded operation may proceed; transitions Open→HalfOpen
    /// once the cooldown has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker half-open; probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                inner.consecutive_failures
            );
        }
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::MockTransport;
    use crate::storage::session_store::MemorySessionStore;

    fn handler() -> ErrorHandler {
        ErrorHandler::new(100, Duration::from_secs(3600), 3, None)
    }

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::new("user1", Arc::new(MockTransport::new())))
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_recovered() {
        let handler = handler();
        let record = ErrorRecord::new(ErrorKind::ValidationError, "bad payload");
        assert!(!handler.handle(record, None).await);
        assert_eq!(handler.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_errors_recover() {
        let handler = handler();
        let conn = connection();
        let record = ErrorRecord::for_connection(ErrorKind::RateLimitError, "limited", &conn);
        assert!(handler.handle(record, Some(&conn)).await);
    }

    #[tokio::test]
    async fn test_heartbeat_recovery_depends_on_transport() {
        let handler = handler();
        let transport = Arc::new(MockTransport::new());
        let conn = Arc::new(Connection::new("user1", transport.clone()));

        let record = ErrorRecord::for_connection(ErrorKind::HeartbeatError, "missed pong", &conn);
        assert!(handler.handle(record, Some(&conn)).await);

        // Successful recovery resets the backoff, so the same scope gets a
        // fresh slot; with the transport gone the attempt now fails.
        transport.set_connected(false);
        let record = ErrorRecord::for_connection(ErrorKind::HeartbeatError, "missed pong", &conn);
        assert!(!handler.handle(record, Some(&conn)).await);
    }

    #[tokio::test]
    async fn test_backoff_refuses_rapid_retries() {
        let handler = handler();
        let transport = Arc::new(MockTransport::new());
        let conn = Arc::new(Connection::new("user1", transport.clone()));
        transport.set_connected(false);

        let first = ErrorRecord::for_connection(ErrorKind::HeartbeatTimeout, "dead", &conn);
        let second = first.clone();
        // First attempt consumes the backoff slot and fails to recover
        assert!(!handler.handle(first, Some(&conn)).await);
        // Second attempt lands inside the backoff window and is refused
        assert!(!handler.handle(second, Some(&conn)).await);
        assert_eq!(handler.stats().await.refused_by_backoff, 1);
    }

    #[tokio::test]
    async fn test_connection_error_persists_resume_state() {
        let store = Arc::new(MemorySessionStore::new());
        let handler = ErrorHandler::new(100, Duration::from_secs(3600), 3, Some(store.clone()));
        let conn = connection();

        let record = ErrorRecord::for_connection(ErrorKind::ConnectionError, "socket gone", &conn);
        assert!(!handler.handle(record, Some(&conn)).await);

        let state = store.get("recovery:user1").await.unwrap();
        let state = state.expect("resume state stored");
        assert_eq!(state["error_kind"], "connection_error");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let handler = ErrorHandler::new(5, Duration::from_secs(3600), 3, None);
        for i in 0..10 {
            let record = ErrorRecord::new(ErrorKind::ValidationError, format!("e{}", i));
            handler.handle(record, None).await;
        }
        assert_eq!(handler.history_len().await, 5);
    }

    #[tokio::test]
    async fn test_retry_count_exhaustion_blocks_recovery() {
        let handler = handler();
        let mut record = ErrorRecord::new(ErrorKind::RateLimitError, "limited");
        record.retry_count = 3;
        record.max_retries = 3;
        assert!(!handler.handle(record, None).await);
    }

    #[test]
    fn test_circuit_breaker_transitions() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }
}
