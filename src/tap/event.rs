//! Normalized key events
//!
//! One `KeyEvent` is produced for every keyDown/keyUp the tap observes,
//! and consumed exactly once by the hold detector.

use super::keys::{KeyCode, ModifierSet};

/// Direction of a key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// Key pressed
    Down,
    /// Key released
    Up,
}

/// A key event normalized from the raw platform stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Whether the key went down or up
    pub direction: KeyDirection,
    /// Virtual key code of the key
    pub key_code: KeyCode,
    /// Modifier keys held when the event was generated
    pub modifiers: ModifierSet,
    /// True for autorepeat events of a held key
    pub is_repeat: bool,
}

impl KeyEvent {
    /// The released counterpart of a captured key-down, used when a
    /// swallowed press has to be replayed as a full tap.
    pub fn released(&self) -> Self {
        Self {
            direction: KeyDirection::Up,
            is_repeat: false,
            ..self.clone()
        }
    }
}
