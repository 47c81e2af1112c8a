//! Named-key mapping for terminal input.
//!
//! Agent CLIs are driven through a small closed set of named keys; anything
//! outside this set is written to the terminal as literal text by the caller.

use serde::{Deserialize, Serialize};

/// Closed enumeration of named keys that map to canonical control sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedKey {
    Enter,
    CtrlC,
    CtrlD,
    Escape,
    Tab,
    Backspace,
    Up,
    Down,
    Left,
    Right,
}

impl NamedKey {
    /// The canonical byte sequence written to the PTY for this key.
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            NamedKey::Enter => b"\r",
            NamedKey::CtrlC => b"\x03",
            NamedKey::CtrlD => b"\x04",
            NamedKey::Escape => b"\x1b",
            NamedKey::Tab => b"\t",
            NamedKey::Backspace => b"\x7f",
            NamedKey::Up => b"\x1b[A",
            NamedKey::Down => b"\x1b[B",
            NamedKey::Right => b"\x1b[C",
            NamedKey::Left => b"\x1b[D",
        }
    }

    /// Parse a key name as used on the wire (`enter`, `ctrl_c`, ...).
    ///
    /// Returns `None` for unknown names; callers pass those through as
    /// literal text instead of failing the command.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "enter" | "return" => Some(NamedKey::Enter),
            "ctrl_c" | "c-c" | "ctrl-c" => Some(NamedKey::CtrlC),
            "ctrl_d" | "c-d" | "ctrl-d" => Some(NamedKey::CtrlD),
            "escape" | "esc" => Some(NamedKey::Escape),
            "tab" => Some(NamedKey::Tab),
            "backspace" => Some(NamedKey::Backspace),
            "up" => Some(NamedKey::Up),
            "down" => Some(NamedKey::Down),
            "left" => Some(NamedKey::Left),
            "right" => Some(NamedKey::Right),
            _ => None,
        }
    }
}
