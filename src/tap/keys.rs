//! Modifier decoding and key-code names
//!
//! Keys are identified by macOS virtual key codes throughout the daemon;
//! configuration refers to them by name ("space", "tab", ...).

use core_graphics::event::CGEventFlags;

/// macOS virtual key code
pub type KeyCode = u16;

/// Virtual key code of the space bar, the default designated key
pub const SPACE: KeyCode = 49;

/// The modifier keys that disqualify a hold gesture.
///
/// Decoded from `CGEventFlags`. The Fn and NumericPad flags are not
/// represented here: arrow and keypad keys carry them on every event, and
/// treating those keys as modified chords would drop a captured key-down
/// instead of replaying it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierSet {
    /// Shift key is held
    pub shift: bool,
    /// Control key is held
    pub control: bool,
    /// Option/Alt key is held
    pub option: bool,
    /// Command key is held
    pub command: bool,
}

impl ModifierSet {
    /// Decode the modifier set from raw event flags
    pub fn from_flags(flags: CGEventFlags) -> Self {
        Self {
            shift: flags.contains(CGEventFlags::CGEventFlagShift),
            control: flags.contains(CGEventFlags::CGEventFlagControl),
            option: flags.contains(CGEventFlags::CGEventFlagAlternate),
            command: flags.contains(CGEventFlags::CGEventFlagCommand),
        }
    }

    /// True if any modifier is held; a cleared set means none are
    pub fn any(&self) -> bool {
        self.shift || self.control || self.option || self.command
    }
}

/// Look up the virtual key code for a configured key name (ANSI layout).
pub fn key_code_for_name(name: &str) -> Option<KeyCode> {
    let code = match name.to_ascii_lowercase().as_str() {
        "space" => SPACE,
        "tab" => 48,
        "return" | "enter" => 36,
        "escape" | "esc" => 53,
        "delete" | "backspace" => 51,
        "grave" | "`" => 50,
        "semicolon" | ";" => 41,
        "quote" | "'" => 39,
        "comma" | "," => 43,
        "period" | "." => 47,
        "slash" | "/" => 44,

        "a" => 0,
        "s" => 1,
        "d" => 2,
        "f" => 3,
        "h" => 4,
        "g" => 5,
        "z" => 6,
        "x" => 7,
        "c" => 8,
        "v" => 9,
        "b" => 11,
        "q" => 12,
        "w" => 13,
        "e" => 14,
        "r" => 15,
        "y" => 16,
        "t" => 17,
        "o" => 31,
        "u" => 32,
        "i" => 34,
        "p" => 35,
        "l" => 37,
        "j" => 38,
        "k" => 40,
        "n" => 45,
        "m" => 46,

        "1" => 18,
        "2" => 19,
        "3" => 20,
        "4" => 21,
        "6" => 22,
        "5" => 23,
        "9" => 25,
        "7" => 26,
        "8" => 28,
        "0" => 29,

        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_has_no_modifiers() {
        let set = ModifierSet::default();
        assert!(!set.any());
    }

    #[test]
    fn test_from_flags_decodes_each_modifier() {
        let set = ModifierSet::from_flags(CGEventFlags::CGEventFlagShift);
        assert!(set.shift);
        assert!(!set.control);
        assert!(set.any());

        let set = ModifierSet::from_flags(
            CGEventFlags::CGEventFlagControl | CGEventFlags::CGEventFlagCommand,
        );
        assert!(set.control);
        assert!(set.command);
        assert!(!set.option);
        assert!(set.any());
    }

    #[test]
    fn test_non_semantic_flags_are_ignored() {
        // Arrow keys carry SecondaryFn + NumericPad; neither counts as a
        // modifier for hold detection.
        let set = ModifierSet::from_flags(
            CGEventFlags::CGEventFlagSecondaryFn | CGEventFlags::CGEventFlagNumericPad,
        );
        assert!(!set.any());
    }

    #[test]
    fn test_key_code_lookup() {
        assert_eq!(key_code_for_name("space"), Some(SPACE));
        assert_eq!(key_code_for_name("Space"), Some(SPACE));
        assert_eq!(key_code_for_name("TAB"), Some(48));
        assert_eq!(key_code_for_name("q"), Some(12));
        assert_eq!(key_code_for_name("holdkey"), None);
    }
}
