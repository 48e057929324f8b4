//! Outbound message batching
//!
//! Messages queue per connection and are flushed as one batch frame when the
//! first trigger fires: queue age, queue length, accumulated bytes, or a
//! high-priority enqueue. The flush is two-phase: Pending messages flip to
//! Sending under the lock and are snapshotted, the transport write happens
//! with the lock released, and the outcome decides Sent-and-removed versus
//! reverted-to-Pending. A concurrent trigger only ever sees Pending items,
//! so no message can ride in two batches.

use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::message::{BatchFrame, OutboundMessage};
use crate::core::recovery::{ErrorHandler, ErrorKind, ErrorRecord};
use crate::core::registry::ConnectionRegistry;
use crate::error::{RelayError, Result};

/// Load (messages per minute) at or below which batches stay minimal
const LOW_LOAD_RATE: f64 = 60.0;
/// Load at or above which batches grow to the configured maximum
const HIGH_LOAD_RATE: f64 = 600.0;
/// Rolling load estimate decays over this window
const LOAD_WINDOW_SECS: f64 = 60.0;
/// Upper bound for the doubling retry delay
const RETRY_DELAY_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: String,
    pub envelope: OutboundMessage,
    pub priority: i32,
    pub state: MessageState,
    pub enqueued_at: Instant,
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_wait: Duration,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_memory_kb: usize,
    pub priority_threshold: i32,
    pub flush_on_high_priority: bool,
    pub max_send_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(100),
            max_batch_size: 25,
            min_batch_size: 5,
            max_batch_memory_kb: 256,
            priority_threshold: 8,
            flush_on_high_priority: true,
            max_send_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct ConnectionQueue {
    messages: Vec<PendingMessage>,
    flush_timer: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    retry_attempts: u32,
}

impl ConnectionQueue {
    fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages
            .iter()
            .filter(|m| m.state == MessageState::Pending)
    }

    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
        if let Some(retry) = self.retry_task.take() {
            retry.abort();
        }
    }
}

struct LoadEstimate {
    rate_per_minute: f64,
    last_event: Instant,
}

/// Counter snapshot for telemetry
#[derive(Debug, Clone, Copy, Default)]
pub struct BatcherStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub batches: u64,
    pub retries: u64,
}

enum FlushOutcome {
    /// Batch delivered
    Sent(usize),
    /// Write failed; messages reverted, retry scheduled
    Reverted(usize),
    /// Retries exhausted; messages dropped with logged loss
    Dropped(usize),
}

pub struct MessageBatcher {
    config: BatcherConfig,
    registry: Arc<ConnectionRegistry>,
    error_handler: Arc<ErrorHandler>,
    queues: Mutex<HashMap<String, ConnectionQueue>>,
    load: std::sync::Mutex<LoadEstimate>,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
}

impl MessageBatcher {
    pub fn new(
        config: BatcherConfig,
        registry: Arc<ConnectionRegistry>,
        error_handler: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            config,
            registry,
            error_handler,
            queues: Mutex::new(HashMap::new()),
            load: std::sync::Mutex::new(LoadEstimate {
                rate_per_minute: 0.0,
                last_event: Instant::now(),
            }),
            enqueued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Queue a message for a connection and flush when a trigger fires
    pub async fn enqueue(
        self: &Arc<Self>,
        connection_id: &str,
        envelope: OutboundMessage,
        priority: i32,
    ) -> Result<()> {
        let size_bytes = serde_json::to_string(&envelope)
            .map_err(|e| RelayError::MessageParseError(e.to_string()))?
            .len();

        self.record_load();
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        let should_flush = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(connection_id.to_string()).or_default();
            queue.messages.push(PendingMessage {
                id: Uuid::new_v4().to_string(),
                envelope,
                priority,
                state: MessageState::Pending,
                enqueued_at: Instant::now(),
                size_bytes,
            });

            let triggered = self.flush_trigger(queue, priority);
            if triggered.is_none() {
                self.ensure_timer(queue, connection_id);
            }
            triggered
        };

        if let Some(reason) = should_flush {
            debug!("Flushing {} batch: {}", connection_id, reason);
            self.flush(connection_id).await?;
        }
        Ok(())
    }

    /// Evaluate flush conditions in their priority order; first hit wins
    fn flush_trigger(&self, queue: &ConnectionQueue, newest_priority: i32) -> Option<&'static str> {
        let oldest = queue.pending().map(|m| m.enqueued_at).min();
        if let Some(oldest) = oldest {
            if oldest.elapsed() >= self.config.max_wait {
                return Some("max wait reached");
            }
        }
        let pending_count = queue.pending().count();
        if pending_count >= self.effective_batch_size() {
            return Some("batch size reached");
        }
        let pending_bytes: usize = queue.pending().map(|m| m.size_bytes).sum();
        if pending_bytes >= self.config.max_batch_memory_kb * 1024 {
            return Some("memory budget reached");
        }
        if self.config.flush_on_high_priority && newest_priority >= self.config.priority_threshold {
            return Some("high priority message");
        }
        None
    }

    /// Keep exactly one outstanding flush timer per connection
    fn ensure_timer(self: &Arc<Self>, queue: &mut ConnectionQueue, connection_id: &str) {
        let stale = queue
            .flush_timer
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true);
        if !stale {
            return;
        }
        let batcher = self.clone();
        let target = connection_id.to_string();
        let wait = self.config.max_wait;
        queue.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(e) = batcher.flush(&target).await {
                debug!("Timed flush for {} failed: {}", target, e);
            }
        }));
    }

    /// Two-phase transactional flush for one connection's queue
    pub async fn flush(self: &Arc<Self>, connection_id: &str) -> Result<usize> {
        // Phase 1: under the lock, claim every Pending message
        let batch: Vec<PendingMessage> = {
            let mut queues = self.queues.lock().await;
            let queue = match queues.get_mut(connection_id) {
                Some(queue) => queue,
                None => return Ok(0),
            };
            if let Some(timer) = queue.flush_timer.take() {
                timer.abort();
            }
            let mut claimed = Vec::new();
            for message in queue.messages.iter_mut() {
                if message.state == MessageState::Pending {
                    message.state = MessageState::Sending;
                    claimed.push(message.clone());
                }
            }
            if claimed.is_empty() {
                if queue.messages.is_empty() && queue.retry_task.is_none() {
                    queues.remove(connection_id);
                }
                return Ok(0);
            }
            // Priority-ordered, stable for ties so enqueue order survives
            claimed.sort_by_key(|m| std::cmp::Reverse(m.priority));
            claimed
        };

        // Phase 2: transport write with no lock held
        let outcome = self.write_batch(connection_id, &batch).await;

        // Phase 3: settle message states under the lock again
        let (flush_outcome, error_record) = {
            let mut queues = self.queues.lock().await;
            let queue = match queues.get_mut(connection_id) {
                Some(queue) => queue,
                // Queue dropped mid-flight (disconnect); nothing to settle
                None => return Ok(0),
            };
            let ids: Vec<&str> = batch.iter().map(|m| m.id.as_str()).collect();
            match outcome {
                Ok(()) => {
                    for message in queue.messages.iter_mut() {
                        if message.state == MessageState::Sending && ids.contains(&message.id.as_str()) {
                            message.state = MessageState::Sent;
                        }
                    }
                    queue
                        .messages
                        .retain(|message| message.state != MessageState::Sent);
                    queue.retry_attempts = 0;
                    if queue.messages.is_empty() && queue.retry_task.is_none() {
                        queues.remove(connection_id);
                    } else if queue.messages.iter().any(|m| m.state == MessageState::Pending) {
                        self.ensure_timer(queue, connection_id);
                    }
                    self.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.batches.fetch_add(1, Ordering::Relaxed);
                    (FlushOutcome::Sent(batch.len()), None)
                }
                Err(ref e) => {
                    queue.retry_attempts += 1;
                    if queue.retry_attempts > self.config.max_send_retries {
                        // Terminal drop: the loss is logged and reported, the
                        // connection's fate stays with heartbeat/cleanup.
                        for message in queue.messages.iter_mut() {
                            if message.state == MessageState::Sending
                                && ids.contains(&message.id.as_str())
                            {
                                message.state = MessageState::Failed;
                            }
                        }
                        queue
                            .messages
                            .retain(|message| message.state != MessageState::Failed);
                        queue.retry_attempts = 0;
                        if queue.messages.is_empty() && queue.retry_task.is_none() {
                            queues.remove(connection_id);
                        }
                        self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        error!(
                            "Dropping batch of {} messages for {} after {} failed sends: {}",
                            batch.len(),
                            connection_id,
                            self.config.max_send_retries + 1,
                            e
                        );
                        let record = ErrorRecord::new(
                            ErrorKind::ConnectionError,
                            format!(
                                "dropped {} batched messages after retry exhaustion",
                                batch.len()
                            ),
                        );
                        (FlushOutcome::Dropped(batch.len()), Some(record))
                    } else {
                        for message in queue.messages.iter_mut() {
                            if message.state == MessageState::Sending
                                && ids.contains(&message.id.as_str())
                            {
                                message.state = MessageState::Pending;
                            }
                        }
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        let attempts = queue.retry_attempts;
                        self.schedule_retry(queue, connection_id, attempts);
                        warn!(
                            "Batch send to {} failed (attempt {}), reverted {} messages: {}",
                            connection_id,
                            attempts,
                            batch.len(),
                            e
                        );
                        (FlushOutcome::Reverted(batch.len()), None)
                    }
                }
            }
        };

        if let Some(mut record) = error_record {
            if let Some(connection) = self.registry.get_by_id(connection_id).await {
                record.connection_id = Some(connection.id.clone());
                record.user_id = Some(connection.user_id.clone());
            }
            self.error_handler.handle(record, None).await;
        }

        match flush_outcome {
            FlushOutcome::Sent(count) => Ok(count),
            FlushOutcome::Reverted(_) | FlushOutcome::Dropped(_) => Ok(0),
        }
    }

    async fn write_batch(&self, connection_id: &str, batch: &[PendingMessage]) -> Result<()> {
        let connection = self
            .registry
            .get_by_id(connection_id)
            .await
            .ok_or_else(|| RelayError::ConnectionNotFound(connection_id.to_string()))?;

        let priorities: Vec<i32> = batch.iter().map(|m| m.priority).collect();
        let total_size: usize = batch.iter().map(|m| m.size_bytes).sum();
        let envelopes: Vec<OutboundMessage> = batch.iter().map(|m| m.envelope.clone()).collect();
        let frame = BatchFrame::new(envelopes, &priorities, total_size);
        let serialized = serde_json::to_string(&frame)
            .map_err(|e| RelayError::MessageParseError(e.to_string()))?;

        connection.send_text(&serialized).await
    }

    fn schedule_retry(self: &Arc<Self>, queue: &mut ConnectionQueue, connection_id: &str, attempt: u32) {
        if let Some(previous) = queue.retry_task.take() {
            previous.abort();
        }
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self
            .config
            .retry_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(RETRY_DELAY_CAP);
        let batcher = self.clone();
        let target = connection_id.to_string();
        queue.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut queues = batcher.queues.lock().await;
                if let Some(queue) = queues.get_mut(&target) {
                    queue.retry_task = None;
                }
            }
            if let Err(e) = batcher.flush(&target).await {
                debug!("Retry flush for {} failed: {}", target, e);
            }
        }));
    }

    /// Flush every queue once; returns the number of messages still queued
    pub async fn flush_all(self: &Arc<Self>) -> usize {
        let targets: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        for target in &targets {
            if let Err(e) = self.flush(target).await {
                debug!("Drain flush for {} failed: {}", target, e);
            }
        }
        self.total_pending().await
    }

    /// Discard a connection's queue, cancelling its timers.
    /// Returns how many messages were thrown away.
    pub async fn drop_queue(&self, connection_id: &str) -> usize {
        let mut queues = self.queues.lock().await;
        match queues.remove(connection_id) {
            Some(mut queue) => {
                queue.cancel_tasks();
                let lost = queue.messages.len();
                if lost > 0 {
                    self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
                    warn!(
                        "Discarded {} undelivered messages for {}",
                        lost, connection_id
                    );
                }
                lost
            }
            None => 0,
        }
    }

    pub async fn pending_count(&self, connection_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(connection_id)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub async fn total_pending(&self) -> usize {
        self.queues
            .lock()
            .await
            .values()
            .map(|queue| queue.messages.len())
            .sum()
    }

    /// Decay-and-bump the rolling load estimate
    fn record_load(&self) {
        let mut load = self.load.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = load.last_event.elapsed().as_secs_f64();
        load.rate_per_minute *= (-elapsed / LOAD_WINDOW_SECS).exp();
        load.rate_per_minute += 1.0;
        load.last_event = Instant::now();
    }

    pub fn current_load(&self) -> f64 {
        let load = self.load.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = load.last_event.elapsed().as_secs_f64();
        load.rate_per_minute * (-elapsed / LOAD_WINDOW_SECS).exp()
    }

    /// Target batch size scaled by load: high load favors throughput with
    /// larger batches, low load favors latency with smaller ones.
    fn effective_batch_size(&self) -> usize {
        let rate = self.current_load();
        let span = (self.config.max_batch_size - self.config.min_batch_size) as f64;
        let fraction = ((rate - LOW_LOAD_RATE) / (HIGH_LOAD_RATE - LOW_LOAD_RATE)).clamp(0.0, 1.0);
        self.config.min_batch_size + (span * fraction).round() as usize
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
