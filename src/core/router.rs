//! Inbound message routing
//!
//! Each frame walks parse → validate → rate-check → dispatch and ends in
//! exactly one terminal outcome. Failures short-circuit with a typed error
//! frame back to the client; dispatch runs under a timeout and a circuit
//! breaker whose fallback path sends a generic processing-failed frame
//! instead of leaking the underlying error.

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::connection::Connection;
use crate::core::message::{error_codes, ErrorFrame, InboundMessage};
use crate::core::rate_limiter::AdaptiveRateLimiter;
use crate::core::recovery::{CircuitBreaker, ErrorHandler, ErrorKind, ErrorRecord};
use crate::core::validator::{MessageValidator, ValidationErrorType};
use crate::error::Result;

/// Business-level handler for one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage, connection: &Arc<Connection>) -> Result<()>;
}

/// Terminal state of one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Completed,
    Failed,
}

/// Counter snapshot for telemetry
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub fallbacks: u64,
}

pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    default_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    validator: MessageValidator,
    limiter: Arc<AdaptiveRateLimiter>,
    error_handler: Arc<ErrorHandler>,
    breaker: CircuitBreaker,
    dispatch_timeout: Duration,
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        validator: MessageValidator,
        limiter: Arc<AdaptiveRateLimiter>,
        error_handler: Arc<ErrorHandler>,
        breaker: CircuitBreaker,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            validator,
            limiter,
            error_handler,
            breaker,
            dispatch_timeout,
            received: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Register the business handler for a message type
    pub async fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(kind.into(), handler);
    }

    /// Handler used when no type-specific handler is registered
    pub async fn set_default_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.default_handler.write().await = Some(handler);
    }

    /// Run one inbound frame through the full pipeline
    pub async fn process(&self, connection: &Arc<Connection>, raw: &str) -> RouteOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        // Parse
        let mut value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("Malformed frame from {}: {}", connection.id, e);
                self.respond(connection, error_codes::INVALID_JSON, "malformed JSON frame", None)
                    .await;
                let record = ErrorRecord::for_connection(
                    ErrorKind::FormatError,
                    format!("unparseable frame: {}", e),
                    connection,
                );
                self.error_handler.handle(record, Some(connection)).await;
                return self.fail();
            }
        };

        // Validate
        if let Err(validation) = self.validator.validate(&value) {
            let (code, kind) = match validation.error_type {
                ValidationErrorType::SecurityError => {
                    (error_codes::SECURITY_ERROR, ErrorKind::SecurityError)
                }
                ValidationErrorType::FormatError => {
                    (error_codes::VALIDATION_ERROR, ErrorKind::FormatError)
                }
                _ => (error_codes::VALIDATION_ERROR, ErrorKind::ValidationError),
            };
            self.respond(connection, code, &validation.message, None).await;
            // Non-recoverable: the client must resend a corrected message
            let record =
                ErrorRecord::for_connection(kind, validation.to_string(), connection);
            self.error_handler.handle(record, Some(connection)).await;
            return self.fail();
        }

        // Rate check
        if self.limiter.is_rate_limited(connection).await {
            let info = self.limiter.get_info(connection).await;
            self.respond(
                connection,
                error_codes::RATE_LIMIT_EXCEEDED,
                "rate limit exceeded, retry after the window resets",
                Some(info.to_json()),
            )
            .await;
            // Violations feed the adaptive limiter
            self.limiter.demote(&connection.id).await;
            let record = ErrorRecord::for_connection(
                ErrorKind::RateLimitError,
                "inbound rate limit exceeded",
                connection,
            );
            self.error_handler.handle(record, Some(connection)).await;
            return self.fail();
        }

        // Sanitize before anything downstream sees the payload
        if let Some(payload) = value.get_mut("payload") {
            self.validator.sanitize(payload);
        }
        connection.bump_message_count();

        let message: InboundMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                self.respond(connection, error_codes::INVALID_JSON, "malformed JSON frame", None)
                    .await;
                let record = ErrorRecord::for_connection(
                    ErrorKind::FormatError,
                    format!("envelope decode failed: {}", e),
                    connection,
                );
                self.error_handler.handle(record, Some(connection)).await;
                return self.fail();
            }
        };

        // Dispatch behind the circuit breaker
        if !self.breaker.allow() {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            self.respond(
                connection,
                error_codes::MESSAGE_PROCESSING_FAILED,
                "message processing temporarily unavailable",
                None,
            )
            .await;
            return self.fail();
        }

        let handler = {
            let handlers = self.handlers.read().await;
            match handlers.get(&message.kind) {
                Some(handler) => Some(handler.clone()),
                None => self.default_handler.read().await.clone(),
            }
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("No handler registered for message type {}", message.kind);
                self.respond(
                    connection,
                    error_codes::INTERNAL_ERROR,
                    "internal error",
                    None,
                )
                .await;
                let record = ErrorRecord::for_connection(
                    ErrorKind::UnexpectedError,
                    format!("no handler for message type {}", message.kind),
                    connection,
                );
                self.error_handler.handle(record, Some(connection)).await;
                return self.fail();
            }
        };

        match tokio::time::timeout(self.dispatch_timeout, handler.handle(&message, connection)).await
        {
            Ok(Ok(())) => {
                self.breaker.record_success();
                self.completed.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Completed
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                // Detail stays in the logs; the client gets a generic frame
                error!(
                    "Handler for {} failed on connection {}: {}",
                    message.kind, connection.id, e
                );
                self.respond(connection, error_codes::INTERNAL_ERROR, "internal error", None)
                    .await;
                let record = ErrorRecord::for_connection(
                    ErrorKind::UnexpectedError,
                    format!("handler failure for {}: {}", message.kind, e),
                    connection,
                );
                self.error_handler.handle(record, Some(connection)).await;
                self.fail()
            }
            Err(_) => {
                self.breaker.record_failure();
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.respond(
                    connection,
                    error_codes::MESSAGE_PROCESSING_FAILED,
                    "message processing timed out",
                    None,
                )
                .await;
                let record = ErrorRecord::for_connection(
                    ErrorKind::UnexpectedError,
                    format!(
                        "dispatch of {} exceeded {:?}",
                        message.kind, self.dispatch_timeout
                    ),
                    connection,
                );
                self.error_handler.handle(record, Some(connection)).await;
                self.fail()
            }
        }
    }

    fn fail(&self) -> RouteOutcome {
        self.failed.fetch_add(1, Ordering::Relaxed);
        RouteOutcome::Failed
    }

    /// Best-effort typed error frame back to the client
    async fn respond(
        &self,
        connection: &Arc<Connection>,
        code: &str,
        message: &str,
        detail: Option<Value>,
    ) {
        let mut frame = ErrorFrame::new(code, message);
        if let Some(detail) = detail {
            frame = frame.with_detail(detail);
        }
        match serde_json::to_string(&frame) {
            Ok(serialized) => {
                if let Err(e) = connection.send_text(&serialized).await {
                    debug!("Failed to deliver error frame to {}: {}", connection.id, e);
                }
            }
            Err(e) => error!("Failed to serialize error frame: {}", e),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}
