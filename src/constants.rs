// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// WebSocket close codes used by the relay
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
