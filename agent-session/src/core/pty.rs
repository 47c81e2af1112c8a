//! PTY process handling.
//!
//! Each terminal session owns one child process spawned under a
//! pseudo-terminal. A dedicated read pump thread copies master-side output
//! into an event channel and the session's ring buffer; the pump emits
//! exactly one `Closed` event after the child exits.

use std::io::Read;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::buffer::OutputRing;

/// Read pump buffer size.
const READ_BUF_SIZE: usize = 4096;

/// Event emitted by a terminal session's read pump.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    /// Raw output bytes, copied out of the read buffer.
    Output(Bytes),
    /// The child process exited and the stream is finished.
    Closed,
}

/// A child process attached to a pseudo-terminal.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    closed: AtomicBool,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `cmd` under a new PTY of the given size.
    ///
    /// The read pump starts immediately: output lands in `ring` and is
    /// forwarded to `events` until the child exits.
    pub fn spawn(
        cmd: CommandBuilder,
        rows: u16,
        cols: u16,
        ring: Arc<OutputRing>,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Self> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size)?;

        let child = pair.slave.spawn_command(cmd)?;
        let pid = child.process_id();
        drop(pair.slave);

        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let child = Arc::new(Mutex::new(child));
        Self::start_read_pump(reader, Arc::clone(&child), ring, events);

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child,
            closed: AtomicBool::new(false),
            pid,
        })
    }

    /// Write bytes to the PTY master.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("PTY writer lock poisoned"))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("PTY master lock poisoned"))?;
        master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Signal the child and release the PTY. Idempotent.
    ///
    /// Sends SIGTERM so agents can run their exit hooks; falls back to the
    /// portable killer when no pid is available. The read pump observes EOF
    /// on the master and emits `Closed` on its own.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }

        #[cfg(not(unix))]
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }

    /// Check whether the child is still running, reaping it if it exited.
    pub fn is_running(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    fn start_read_pump(
        mut reader: Box<dyn Read + Send>,
        child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
        ring: Arc<OutputRing>,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) {
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        ring.push(&buf[..n]);
                        // Copy out so the event owns its bytes independent of
                        // the read buffer.
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(TerminalEvent::Output(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }

            // Reap the child before reporting closure so exit status is not
            // left dangling.
            if let Ok(mut child) = child.lock() {
                if let Err(e) = child.wait() {
                    warn!("child wait failed: {}", e);
                }
            }
            let _ = events.send(TerminalEvent::Closed);
        });
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
