//! # Terminal session runtime for interactive coding agents
//!
//! `agent-session` manages fleets of agent CLI processes running under
//! pseudo-terminals. It covers the full path from raw PTY bytes to
//! chat-ready, classified output:
//!
//! - **Terminal backend**: spawn/write/resize/destroy children behind the
//!   [`core::TerminalBackend`] capability trait, with a per-session ring
//!   buffer and a finite event stream (`Output…` then exactly one
//!   `Closed`).
//! - **Output parsing**: ANSI stripping, segmentation with a timeout/flush
//!   policy, prompt/error/code classification with synthesized prompt
//!   actions, and activity inference (working/waiting/idle/disconnected).
//! - **Command queue**: one in-flight command per session with a
//!   `queued → sent → acked → completed` state machine, ack on first
//!   output, completion on quiescent segments or explicit tokens.
//! - **Command policy**: destructive-pattern denial and working-directory
//!   path scoping, failing closed when the scope cannot be resolved.
//! - **Event bus**: typed fan-out with per-session filters, bounded
//!   drop-oldest subscriber queues, and output coalescing.
//! - **Session manager**: lifecycle with rollback, readiness gating,
//!   human-takeover reference counting, and a per-session idle monitor.
//!
//! ```rust,no_run
//! use agent_session::{EventBus, PtyBackend, SessionManager, SessionSpec};
//! use agent_session::queue::CommandOp;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = Arc::new(EventBus::new());
//!     let manager = SessionManager::new(Arc::new(PtyBackend::new()), bus);
//!
//!     let session = manager.create_session(SessionSpec::new("coder", "claude")).await?;
//!     manager
//!         .enqueue_command(
//!             &session.id,
//!             CommandOp::SendText,
//!             serde_json::json!({"text": "implement the parser\n"}),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod bus;
pub mod core;
pub mod manager;
pub mod parser;
pub mod policy;
pub mod queue;

pub use buffer::{OutputLine, OutputRing, ParsedRing};
pub use bus::{BusEvent, EventBus, Subscriber, WindowInfo};
pub use core::{NamedKey, PtyBackend, SpawnSpec, TerminalBackend, TerminalError, TerminalEvent};
pub use manager::{
    DONE_MARKER, EnqueueError, ManagedSession, PauseHook, ReadyProbe, SessionManager,
    SessionSnapshot, SessionSpec, SessionState,
};
pub use parser::{MessageClass, OutputParser, ParsedMessage, PromptAction, SessionActivity};
pub use policy::{CommandPolicy, PolicyViolation};
pub use queue::{CommandOp, CommandPhase, CommandQueue, CommandRecord};
