//! Inbound message validation and sanitization
//!
//! Validation is a short-circuiting pipeline: structure, type presence,
//! security scan, type recognition, per-type schema, serialized size. The
//! security scan runs before the schema and size checks so a message that is
//! both malformed and malicious is still reported as a security event.

use log::warn;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Patterns that indicate script/markup injection attempts
const SCRIPT_PATTERNS: &[&str] = &[
    "<script",
    "</script",
    "<iframe",
    "</iframe",
    "javascript:",
    "vbscript:",
    "onload=",
    "onclick=",
    "onerror=",
    "onmouseover=",
    "onfocus=",
    "eval(",
    "expression(",
];

/// Markers commonly seen in SQL injection probes
const SQL_PATTERNS: &[&str] = &[
    "union select",
    "drop table",
    "insert into",
    "delete from",
    "' or '1'='1",
    "\" or \"1\"=\"1",
    "or 1=1",
    "; --",
];

/// Markers for server-side template injection
const TEMPLATE_PATTERNS: &[&str] = &["{{", "}}", "${", "<%", "%>"];

/// HTML entities produced by `escape_text`; `&` must stay first so raw
/// ampersands are encoded before the other replacements introduce new ones.
const HTML_ENTITIES: &[(char, &str)] = &[
    ('&', "&amp;"),
    ('<', "&lt;"),
    ('>', "&gt;"),
    ('"', "&quot;"),
    ('\'', "&#x27;"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorType {
    FormatError,
    TypeError,
    ValidationError,
    SecurityError,
}

impl ValidationErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FormatError => "format_error",
            Self::TypeError => "type_error",
            Self::ValidationError => "validation_error",
            Self::SecurityError => "security_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub error_type: ValidationErrorType,
    pub message: String,
    pub field: Option<String>,
}

impl ValidationError {
    fn new(error_type: ValidationErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            field: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} ({}): {}", self.error_type.as_str(), field, self.message),
            None => write!(f, "{}: {}", self.error_type.as_str(), self.message),
        }
    }
}

/// Expected JSON kind for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl JsonKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// Required payload fields for one message type
#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    required: Vec<(String, JsonKind)>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: JsonKind) -> Self {
        self.required.push((field.into(), kind));
        self
    }
}

pub struct MessageValidator {
    schemas: HashMap<String, MessageSchema>,
    max_message_size: usize,
    max_text_length: usize,
    allow_unknown_types: bool,
}

impl MessageValidator {
    pub fn new(max_message_size: usize, max_text_length: usize, allow_unknown_types: bool) -> Self {
        Self {
            schemas: HashMap::new(),
            max_message_size,
            max_text_length,
            allow_unknown_types,
        }
    }

    /// Validator preloaded with the platform's standard message types
    pub fn with_default_schemas(
        max_message_size: usize,
        max_text_length: usize,
        allow_unknown_types: bool,
    ) -> Self {
        let mut validator = Self::new(max_message_size, max_text_length, allow_unknown_types);
        validator.register_schema(
            "user_message",
            MessageSchema::new().require("text", JsonKind::String),
        );
        validator.register_schema(
            "join_room",
            MessageSchema::new().require("room_id", JsonKind::String),
        );
        validator.register_schema(
            "leave_room",
            MessageSchema::new().require("room_id", JsonKind::String),
        );
        validator.register_schema("ping", MessageSchema::new());
        validator.register_schema("pong", MessageSchema::new());
        validator.register_schema(
            "agent_request",
            MessageSchema::new().require("prompt", JsonKind::String),
        );
        validator.register_schema("status_request", MessageSchema::new());
        validator
    }

    pub fn register_schema(&mut self, kind: impl Into<String>, schema: MessageSchema) {
        self.schemas.insert(kind.into(), schema);
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.schemas.keys().map(|k| k.as_str()).collect()
    }

    /// Run the full validation pipeline, stopping at the first failure
    pub fn validate(&self, message: &Value) -> Result<(), ValidationError> {
        // (1) structured object
        let object = message.as_object().ok_or_else(|| {
            ValidationError::new(
                ValidationErrorType::FormatError,
                "message must be a JSON object",
            )
        })?;

        // (2) type field present
        let kind_value = object.get("type").ok_or_else(|| {
            ValidationError::new(ValidationErrorType::ValidationError, "missing type field")
                .with_field("type")
        })?;
        let kind = kind_value.as_str().ok_or_else(|| {
            ValidationError::new(ValidationErrorType::TypeError, "type must be a string")
                .with_field("type")
        })?;

        // (3) security scan before anything payload-shaped is trusted
        let payload = object.get("payload").cloned().unwrap_or(Value::Null);
        self.security_scan(&payload)?;

        // (4) recognized type
        let schema = match self.schemas.get(kind) {
            Some(schema) => Some(schema),
            None if self.allow_unknown_types => None,
            None => {
                return Err(ValidationError::new(
                    ValidationErrorType::ValidationError,
                    format!("unknown message type: {}", kind),
                )
                .with_field("type"));
            }
        };

        // (5) per-type schema
        if let Some(schema) = schema {
            let payload_object = payload.as_object();
            for (field, expected) in &schema.required {
                let value = payload_object.and_then(|p| p.get(field));
                match value {
                    None => {
                        return Err(ValidationError::new(
                            ValidationErrorType::ValidationError,
                            format!("missing required field: {}", field),
                        )
                        .with_field(field.clone()));
                    }
                    Some(value) if !expected.matches(value) => {
                        return Err(ValidationError::new(
                            ValidationErrorType::TypeError,
                            format!("field {} must be a {}", field, expected.as_str()),
                        )
                        .with_field(field.clone()));
                    }
                    _ => {}
                }
            }
        }

        // (6) serialized size
        let serialized_len = serde_json::to_string(message)
            .map(|s| s.len())
            .unwrap_or(usize::MAX);
        if serialized_len > self.max_message_size {
            return Err(ValidationError::new(
                ValidationErrorType::ValidationError,
                format!(
                    "message size {} exceeds limit {}",
                    serialized_len, self.max_message_size
                ),
            ));
        }

        Ok(())
    }

    fn security_scan(&self, payload: &Value) -> Result<(), ValidationError> {
        scan_value(payload).map_err(|pattern| {
            warn!("Security pattern detected in payload: {}", pattern);
            ValidationError::new(
                ValidationErrorType::SecurityError,
                format!("payload contains disallowed pattern: {}", pattern),
            )
        })
    }

    /// Sanitize every free-text field in place: HTML-escape and truncate.
    /// Running sanitize twice yields the same result as running it once.
    pub fn sanitize(&self, message: &mut Value) {
        sanitize_value(message, self.max_text_length);
    }
}

fn scan_value(value: &Value) -> Result<(), &'static str> {
    match value {
        Value::String(s) => scan_text(s),
        Value::Array(items) => {
            for item in items {
                scan_value(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                scan_text(key)?;
                scan_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn scan_text(text: &str) -> Result<(), &'static str> {
    let lowered = text.to_lowercase();
    for pattern in SCRIPT_PATTERNS
        .iter()
        .chain(SQL_PATTERNS)
        .chain(TEMPLATE_PATTERNS)
    {
        if lowered.contains(pattern) {
            return Err(*pattern);
        }
    }
    Ok(())
}

fn sanitize_value(value: &mut Value, max_text_length: usize) {
    match value {
        Value::String(s) => {
            let escaped = escape_text(s);
            *s = truncate_text(escaped, max_text_length);
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item, max_text_length);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitize_value(item, max_text_length);
            }
        }
        _ => {}
    }
}

/// Entity-aware HTML escaping: raw special characters are encoded, but an
/// ampersand that already starts one of our entities is left alone so the
/// function is idempotent.
fn escape_text(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let rest = &input[i..];
        if bytes[i] == b'&' {
            for (_, entity) in HTML_ENTITIES {
                if rest.starts_with(entity) {
                    result.push_str(entity);
                    i += entity.len();
                    continue 'outer;
                }
            }
            result.push_str("&amp;");
            i += 1;
            continue;
        }
        let ch = rest.chars().next().unwrap_or('\u{FFFD}');
        match HTML_ENTITIES.iter().find(|(raw, _)| *raw == ch) {
            Some((_, entity)) => result.push_str(entity),
            None => result.push(ch),
        }
        i += ch.len_utf8();
    }
    result
}

/// Truncate to a byte budget without splitting a UTF-8 character or one of
/// our HTML entities; an already-short string passes through untouched.
fn truncate_text(mut input: String, max_length: usize) -> String {
    if input.len() <= max_length {
        return input;
    }

    let mut cut = max_length;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }

    // Longest entity is 6 bytes; back the cut off to the start of a
    // partially kept entity so a re-escape pass sees only complete ones.
    let mut window_start = cut.saturating_sub(6);
    while window_start > 0 && !input.is_char_boundary(window_start) {
        window_start -= 1;
    }
    if let Some(amp_offset) = input[window_start..cut].rfind('&') {
        let amp_index = window_start + amp_offset;
        if !input[amp_index..cut].contains(';') {
            cut = amp_index;
        }
    }

    input.truncate(cut);
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> MessageValidator {
        MessageValidator::with_default_schemas(2048, 100, false)
    }

    #[test]
    fn test_rejects_non_object() {
        let err = validator().validate(&json!("just a string")).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::FormatError);
    }

    #[test]
    fn test_rejects_missing_type() {
        let err = validator()
            .validate(&json!({"payload": {"text": "hi"}}))
            .unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::ValidationError);
        assert_eq!(err.field.as_deref(), Some("type"));
    }

    #[test]
    fn test_script_payload_is_security_error() {
        let message = json!({
            "type": "user_message",
            "payload": {"text": "<script>alert(1)</script>"}
        });
        let err = validator().validate(&message).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::SecurityError);
    }

    #[test]
    fn test_sql_and_template_markers_are_security_errors() {
        for text in ["1; DROP TABLE users; --", "{{config.secret}}", "x' OR '1'='1"] {
            let message = json!({"type": "user_message", "payload": {"text": text}});
            let err = validator().validate(&message).unwrap_err();
            assert_eq!(err.error_type, ValidationErrorType::SecurityError, "{}", text);
        }
    }

    #[test]
    fn test_security_wins_over_size() {
        // Oversized AND malicious: must still be classified as security
        let big = "x".repeat(4096);
        let message = json!({
            "type": "user_message",
            "payload": {"text": format!("<script>{}</script>", big)}
        });
        let err = validator().validate(&message).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::SecurityError);
    }

    #[test]
    fn test_unknown_type_rejected_unless_allowed() {
        let message = json!({"type": "mystery", "payload": {}});
        let err = validator().validate(&message).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::ValidationError);

        let permissive = MessageValidator::with_default_schemas(2048, 100, true);
        assert!(permissive.validate(&message).is_ok());
    }

    #[test]
    fn test_schema_enforces_required_fields() {
        let missing = json!({"type": "user_message", "payload": {}});
        let err = validator().validate(&missing).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("text"));

        let wrong_kind = json!({"type": "user_message", "payload": {"text": 42}});
        let err = validator().validate(&wrong_kind).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::TypeError);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = json!({
            "type": "user_message",
            "payload": {"text": "x".repeat(4096)}
        });
        let err = validator().validate(&message).unwrap_err();
        assert_eq!(err.error_type, ValidationErrorType::ValidationError);
        assert!(err.message.contains("size"));
    }

    #[test]
    fn test_valid_message_passes() {
        let message = json!({
            "type": "user_message",
            "payload": {"text": "hello there"},
            "timestamp": 1700000000.5
        });
        assert!(validator().validate(&message).is_ok());
    }

    #[test]
    fn test_sanitize_escapes_markup() {
        let mut message = json!({"text": "<script>alert(1)</script>"});
        validator().sanitize(&mut message);
        assert_eq!(
            message["text"],
            "&lt;script&gt;alert(1)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            json!({"text": "<b>bold & 'quoted'</b>"}),
            json!({"text": "already &lt;escaped&gt; &amp; fine"}),
            json!({"nested": {"list": ["<i>", "&", "plain"]}}),
            json!({"text": "x".repeat(500)}),
        ];
        let validator = validator();
        for input in inputs {
            let mut once = input.clone();
            validator.sanitize(&mut once);
            let mut twice = once.clone();
            validator.sanitize(&mut twice);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_truncation_does_not_split_entities() {
        let validator = MessageValidator::with_default_schemas(2048, 10, false);
        // Escapes to "aaaaaaaa&lt;" (12 bytes); the cut at 10 would land
        // inside "&lt;" so the whole entity must go.
        let mut message = json!({"text": "aaaaaaaa<"});
        validator.sanitize(&mut message);
        assert_eq!(message["text"], "aaaaaaaa");

        let mut again = message.clone();
        validator.sanitize(&mut again);
        assert_eq!(message, again);
    }
}
