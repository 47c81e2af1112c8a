//! Terminal backend abstraction.
//!
//! The backend owns the live file descriptors: spawning a child under a
//! pseudo-terminal, streaming its output, accepting writes, and propagating
//! resize and termination. Everything above this layer (queueing, parsing,
//! status) works against the [`TerminalBackend`] trait so a multiplexer or
//! remote terminal host can slot in behind the same capability set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use portable_pty::CommandBuilder;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use crate::buffer::OutputRing;
use crate::core::keys::NamedKey;
use crate::core::pty::{PtyProcess, TerminalEvent};

/// Default per-session ring buffer capacity: 256 KiB.
pub const DEFAULT_RING_CAPACITY: usize = 256 * 1024;

/// Terminal backend error type.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn terminal: {0}")]
    SpawnFailed(String),

    #[error("terminal already exists: {0}")]
    DuplicateId(String),

    #[error("unknown terminal: {0}")]
    UnknownSession(String),

    #[error("terminal closed: {0}")]
    SessionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal backend result type.
pub type TerminalResult<T> = std::result::Result<T, TerminalError>;

/// Parameters for spawning a terminal session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Caller-chosen unique terminal id.
    pub id: String,
    /// Human-readable window name.
    pub name: String,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Working directory for the child.
    pub work_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Initial window size (cols, rows).
    pub size: (u16, u16),
}

impl SpawnSpec {
    pub fn new(id: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            argv,
            work_dir: None,
            env: HashMap::new(),
            size: (80, 24),
        }
    }
}

/// Capability set every terminal backend provides.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Spawn a new terminal session.
    async fn create_session(&self, spec: SpawnSpec) -> TerminalResult<()>;

    /// Write raw bytes to the session's input.
    async fn write(&self, id: &str, bytes: &[u8]) -> TerminalResult<()>;

    /// Write the control sequence for a named key.
    async fn send_key(&self, id: &str, key: NamedKey) -> TerminalResult<()>;

    /// Update the window size.
    async fn resize(&self, id: &str, cols: u16, rows: u16) -> TerminalResult<()>;

    /// The most recent `lines` lines from the session's ring buffer.
    async fn capture_output(&self, id: &str, lines: usize) -> TerminalResult<Vec<String>>;

    /// Whether a session with this id is registered.
    fn session_exists(&self, id: &str) -> bool;

    /// Signal the child and release the terminal. Idempotent.
    async fn destroy_session(&self, id: &str) -> TerminalResult<()>;

    /// Take the session's event stream. Yields `Output` events followed by
    /// exactly one `Closed`, then ends. Each stream can be taken once.
    async fn take_events(&self, id: &str)
    -> TerminalResult<mpsc::UnboundedReceiver<TerminalEvent>>;
}

/// Split a command string into argv, routing shell metacharacters through
/// `sh -c` so pipelines and substitutions behave as the agent intended.
pub fn shell_argv(command: &str) -> Vec<String> {
    const META: &[char] = &['\n', '|', '&', ';', '$', '`'];
    if command.contains(META) {
        vec!["sh".to_string(), "-c".to_string(), command.to_string()]
    } else {
        command.split_whitespace().map(str::to_string).collect()
    }
}

struct PtyEntry {
    process: Arc<PtyProcess>,
    ring: Arc<OutputRing>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TerminalEvent>>>,
}

/// Native pseudo-terminal backend.
pub struct PtyBackend {
    sessions: DashMap<String, Arc<PtyEntry>>,
    ring_capacity: usize,
}

impl PtyBackend {
    pub fn new() -> Self {
        Self::with_ring_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_ring_capacity(ring_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ring_capacity,
        }
    }

    fn entry(&self, id: &str) -> TerminalResult<Arc<PtyEntry>> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TerminalError::UnknownSession(id.to_string()))
    }
}

impl Default for PtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    async fn create_session(&self, spec: SpawnSpec) -> TerminalResult<()> {
        if spec.argv.is_empty() || spec.argv[0].is_empty() {
            return Err(TerminalError::EmptyCommand);
        }
        if self.sessions.contains_key(&spec.id) {
            return Err(TerminalError::DuplicateId(spec.id));
        }

        let mut cmd = CommandBuilder::new(&spec.argv[0]);
        for arg in &spec.argv[1..] {
            cmd.arg(arg);
        }
        if let Some(dir) = &spec.work_dir {
            cmd.cwd(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let ring = Arc::new(OutputRing::new(self.ring_capacity));
        let (tx, rx) = mpsc::unbounded_channel();
        let (cols, rows) = spec.size;
        let process = PtyProcess::spawn(cmd, rows, cols, Arc::clone(&ring), tx)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;

        info!(terminal = %spec.id, command = %spec.argv[0], "spawned terminal session");
        self.sessions.insert(
            spec.id,
            Arc::new(PtyEntry {
                process: Arc::new(process),
                ring,
                events: Mutex::new(Some(rx)),
            }),
        );
        Ok(())
    }

    async fn write(&self, id: &str, bytes: &[u8]) -> TerminalResult<()> {
        let entry = self.entry(id)?;
        if entry.process.is_closed() {
            return Err(TerminalError::SessionClosed(id.to_string()));
        }
        entry
            .process
            .write(bytes)
            .map_err(|e| TerminalError::SessionClosed(format!("{}: {}", id, e)))
    }

    async fn send_key(&self, id: &str, key: NamedKey) -> TerminalResult<()> {
        self.write(id, key.bytes()).await
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> TerminalResult<()> {
        let entry = self.entry(id)?;
        entry
            .process
            .resize(cols, rows)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))
    }

    async fn capture_output(&self, id: &str, lines: usize) -> TerminalResult<Vec<String>> {
        let entry = self.entry(id)?;
        Ok(entry.ring.last_lines(lines))
    }

    fn session_exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    async fn destroy_session(&self, id: &str) -> TerminalResult<()> {
        // Idempotent: destroying an unknown or already closed session is not
        // an error.
        if let Some(entry) = self.sessions.get(id).map(|e| Arc::clone(e.value())) {
            entry.process.close();
        }
        Ok(())
    }

    async fn take_events(
        &self,
        id: &str,
    ) -> TerminalResult<mpsc::UnboundedReceiver<TerminalEvent>> {
        let entry = self.entry(id)?;
        let mut guard = entry.events.lock().await;
        guard
            .take()
            .ok_or_else(|| TerminalError::SessionClosed(format!("{}: events already taken", id)))
    }
}
