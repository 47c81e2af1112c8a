//! ANSI escape stripping.
//!
//! Classification and chat rendering work on plain text; the raw byte
//! stream stays available to clients that render a live terminal.

use once_cell::sync::Lazy;
use regex::Regex;

// CSI (including private-mode parameters), OSC terminated by BEL or ST,
// and lone two-byte escapes.
static CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());
static OSC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());
static ESC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[@-Z\\-_]").unwrap());

/// Strip CSI/OSC/SGR escape sequences and non-printing control characters,
/// keeping newlines and tabs. Idempotent on already-stripped input.
pub fn strip_ansi(input: &str) -> String {
    let stripped = CSI.replace_all(input, "");
    let stripped = OSC.replace_all(&stripped, "");
    let stripped = ESC.replace_all(&stripped, "");

    // Carriage returns collapse to line boundaries; remaining C0 controls
    // (progress spinners, BEL) are dropped.
    let mut out = String::with_capacity(stripped.len());
    for ch in stripped.chars() {
        match ch {
            '\r' => {}
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
