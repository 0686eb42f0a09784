//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian
//! length. After a successful `Subscribe`, the connection becomes
//! push-only: the daemon sends `Notification` messages until the client
//! disconnects.

use serde::{Deserialize, Serialize};

use crate::events::DetectorEvent;

/// Requests from clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to detector notifications
    Subscribe,
}

/// Responses from daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed; notifications follow on this connection
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A detector event occurred
    Event {
        /// The event being delivered
        event: DetectorEvent,
    },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Name of the designated key
    pub key: String,

    /// Configured hold delay in milliseconds
    pub hold_delay_ms: u64,

    /// Whether the event tap is active
    pub tap_active: bool,

    /// Whether a hold is currently active
    pub holding: bool,

    /// Number of holds detected since startup
    pub holds_detected: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    /// Initial status for the configured key
    pub fn new(key: &str, hold_delay_ms: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            key: key.to_string(),
            hold_delay_ms,
            tap_active: false,
            holding: false,
            holds_detected: 0,
            uptime_secs: 0,
        }
    }
}
