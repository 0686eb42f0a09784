//! Keyboard event tap module
//!
//! Owns the CGEventTap that observes and filters the system-wide
//! keyboard stream, and the normalized event types shared with the hold
//! detector.

mod event;
mod keys;
mod listener;

pub use event::{KeyDirection, KeyEvent};
pub use keys::{key_code_for_name, KeyCode, ModifierSet, SPACE};
pub use listener::{EventTap, TapError};
