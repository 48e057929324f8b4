use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum RelayError {
    // Registry errors
    RegistryLock(String),
    ConnectionNotFound(String),

    // Connection errors
    ConnectionFailure(String),
    ConnectionClosed,
    ConnectionLimit(String),

    // Message errors
    MessageParseError(String),
    MessageTooLarge(usize),
    NoHandler(String),
    DispatchTimeout(String),

    // Rate limiting
    RateLimited(String),

    // Room errors
    RoomNotFound(String),

    // Validation errors
    ValidationError(String),
    SecurityViolation(String),

    // Circuit breaker
    CircuitOpen(String),

    // Storage errors
    StorageError(String),

    // System errors
    SystemError(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryLock(msg) => write!(f, "Registry lock error: {}", msg),
            Self::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            Self::ConnectionFailure(msg) => write!(f, "Connection failure: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::ConnectionLimit(user) => write!(f, "Connection limit exceeded for user: {}", user),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::NoHandler(kind) => write!(f, "No handler registered for message type: {}", kind),
            Self::DispatchTimeout(kind) => write!(f, "Dispatch timed out for message type: {}", kind),
            Self::RateLimited(msg) => write!(f, "Rate limit exceeded: {}", msg),
            Self::RoomNotFound(id) => write!(f, "Room not found: {}", id),
            Self::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Self::SecurityViolation(msg) => write!(f, "Security violation: {}", msg),
            Self::CircuitOpen(op) => write!(f, "Circuit breaker open for: {}", op),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::SystemError(msg) => write!(f, "System error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for RelayError {}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for RelayError {
    fn from(err: PoisonError<T>) -> Self {
        RelayError::RegistryLock(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for RustyRelay
pub type Result<T> = std::result::Result<T, RelayError>;
