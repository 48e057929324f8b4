//! Wire envelopes exchanged with clients

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Stable error codes surfaced to clients
pub mod error_codes {
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const SECURITY_ERROR: &str = "SECURITY_ERROR";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const MESSAGE_PROCESSING_FAILED: &str = "MESSAGE_PROCESSING_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Inbound client frame. Unknown top-level fields are preserved so older
/// servers stay forward-compatible with newer clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Outbound envelope queued for delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: unix_timestamp(),
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }
}

/// Error frame sent back to the offending client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: ErrorPayload,
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorFrame {
    pub fn new(error_code: &str, message: &str) -> Self {
        Self {
            kind: "error".to_string(),
            payload: ErrorPayload {
                error_code: error_code.to_string(),
                message: message.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                detail: None,
            },
            sender: "system".to_string(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.payload.detail = Some(detail);
        self
    }
}

/// Batch frame grouping several outbound messages into one transport write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub batch_id: String,
    pub messages: Vec<OutboundMessage>,
    pub message_count: usize,
    pub timestamp: f64,
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_size: usize,
    pub priority_distribution: HashMap<String, usize>,
    pub total_size_bytes: usize,
}

impl BatchFrame {
    pub fn new(messages: Vec<OutboundMessage>, priorities: &[i32], total_size_bytes: usize) -> Self {
        let mut priority_distribution: HashMap<String, usize> = HashMap::new();
        for priority in priorities {
            *priority_distribution.entry(priority.to_string()).or_insert(0) += 1;
        }
        let message_count = messages.len();
        Self {
            kind: "batch".to_string(),
            batch_id: Uuid::new_v4().to_string(),
            messages,
            message_count,
            timestamp: unix_timestamp(),
            metadata: BatchMetadata {
                batch_size: message_count,
                priority_distribution,
                total_size_bytes,
            },
        }
    }
}

/// Seconds since the epoch with sub-second precision
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_preserves_unknown_fields() {
        let raw = r#"{"type":"user_message","payload":{"text":"hi"},"trace_id":"abc"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "user_message");
        assert_eq!(msg.extra.get("trace_id"), Some(&json!("abc")));

        let round = serde_json::to_value(&msg).unwrap();
        assert_eq!(round.get("trace_id"), Some(&json!("abc")));
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ErrorFrame::new(error_codes::INVALID_JSON, "bad frame");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["sender"], "system");
        assert_eq!(value["payload"]["error_code"], "INVALID_JSON");
        assert!(value["payload"]["timestamp"].is_string());
    }

    #[test]
    fn test_batch_frame_metadata() {
        let messages = vec![
            OutboundMessage::new("user_message", json!({"text": "a"})),
            OutboundMessage::new("user_message", json!({"text": "b"})),
            OutboundMessage::new("status", json!({"ok": true})),
        ];
        let frame = BatchFrame::new(messages, &[1, 1, 5], 120);
        assert_eq!(frame.message_count, 3);
        assert_eq!(frame.metadata.batch_size, 3);
        assert_eq!(frame.metadata.priority_distribution.get("1"), Some(&2));
        assert_eq!(frame.metadata.priority_distribution.get("5"), Some(&1));
        assert_eq!(frame.metadata.total_size_bytes, 120);
    }
}
