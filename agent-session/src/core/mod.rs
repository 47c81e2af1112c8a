//! Terminal backend core: PTY processes, the backend capability trait, and
//! named-key input.

pub mod keys;
pub mod pty;
pub mod terminal;

pub use keys::NamedKey;
pub use pty::{PtyProcess, TerminalEvent};
pub use terminal::{
    DEFAULT_RING_CAPACITY, PtyBackend, SpawnSpec, TerminalBackend, TerminalError, TerminalResult,
    shell_argv,
};
