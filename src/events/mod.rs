//! Notification events emitted by the hold detector
//!
//! Broadcast to in-process consumers and pushed to subscribed IPC
//! clients.

use serde::{Deserialize, Serialize};

/// Events emitted by the hold detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorEvent {
    /// The designated key was held past the hold delay
    KeyHeld {
        /// Name of the designated key (e.g. "space")
        key: String,
    },

    /// An active hold ended: the key was released, or the hold was torn
    /// down by a modifier chord or a tap interruption
    HoldEnded {
        /// Name of the designated key
        key: String,
        /// Milliseconds between the hold firing and its end
        held_ms: u64,
    },

    /// The event tap was disabled by the system; suppression was
    /// suspended and the detector reset
    TapInterrupted,
}

impl std::fmt::Display for DetectorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorEvent::KeyHeld { key } => write!(f, "KEY_HELD ({})", key),
            DetectorEvent::HoldEnded { key, held_ms } => {
                write!(f, "HOLD_ENDED ({}, {}ms)", key, held_ms)
            }
            DetectorEvent::TapInterrupted => write!(f, "TAP_INTERRUPTED"),
        }
    }
}
