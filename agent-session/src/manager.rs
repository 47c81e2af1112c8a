//! Session lifecycle and runtime.
//!
//! The manager owns every live session: it spawns the terminal, pumps
//! output through the parser into the ring and the event bus, drives the
//! command queue, enforces the command policy, runs the readiness gate and
//! the idle monitor, and ref-counts human takeover. Automation layers
//! integrate through registered pause hooks and an injected readiness
//! probe rather than direct references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{OutputLine, ParsedRing};
use crate::bus::{BusEvent, EventBus, WindowInfo};
use crate::core::{NamedKey, SpawnSpec, TerminalBackend, TerminalEvent, shell_argv};
use crate::parser::{MessageClass, OutputParser, ParsedMessage, SessionActivity};
use crate::policy::{CommandPolicy, PolicyViolation};
use crate::queue::{CommandOp, CommandQueue, CommandRecord, Dispatch};

/// Retained parsed segments per session.
const PARSED_RING_DEPTH: usize = 2048;
/// Monitor tick period.
const MONITOR_TICK: Duration = Duration::from_secs(1);
/// Readable name-collision retries before falling back to a random suffix.
const NAME_RETRIES: u32 = 8;
/// Completion marker file relative to the session working directory.
pub const DONE_MARKER: &str = ".orchestra/done";

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Working,
    Waiting,
    WaitingReview,
    HumanTakeover,
    Idle,
    Completed,
    Failed,
    Disconnected,
}

impl SessionState {
    /// Terminal states hold no live process.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Disconnected
        )
    }

    /// Wire-level activity for the session list.
    pub fn activity(&self) -> SessionActivity {
        match self {
            SessionState::Waiting => SessionActivity::Waiting,
            SessionState::Idle => SessionActivity::Idle,
            SessionState::Completed | SessionState::Failed | SessionState::Disconnected => {
                SessionActivity::Disconnected
            }
            _ => SessionActivity::Working,
        }
    }
}

/// Parameters for creating a managed session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Requested window name; de-duplicated on collision.
    pub name: String,
    /// Agent command line.
    pub command: String,
    pub work_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub task_id: Option<String>,
    pub agent_type: String,
    pub role: String,
    /// Optional per-agent readiness pattern matched against early output.
    pub readiness_pattern: Option<String>,
    pub size: (u16, u16),
}

impl SessionSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            work_dir: None,
            env: HashMap::new(),
            task_id: None,
            agent_type: "shell".to_string(),
            role: "coder".to_string(),
            readiness_pattern: None,
            size: (80, 24),
        }
    }
}

/// Read-only view of a session for listings and the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub name: String,
    pub task_id: Option<String>,
    pub agent_type: String,
    pub role: String,
    pub state: SessionState,
    pub human_attached: bool,
    pub attached_viewer_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Called with `(session_id, paused)` when takeover pauses or resumes
/// automation for a session.
pub type PauseHook = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Checks the working directory for an external ready-for-review signal.
pub type ReadyProbe = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// One live session under management.
pub struct ManagedSession {
    pub id: String,
    pub name: String,
    pub task_id: Option<String>,
    pub agent_type: String,
    pub role: String,
    pub work_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    resume_state: Mutex<SessionState>,
    viewer_count: Mutex<usize>,
    last_activity: RwLock<DateTime<Utc>>,
    parser: Mutex<OutputParser>,
    parsed: ParsedRing,
    queue: CommandQueue,
    ready: AtomicBool,
    ready_notify: Notify,
    readiness_pattern: Option<Regex>,
    completion_signaled: AtomicBool,
    destroy_requested: AtomicBool,
}

impl ManagedSession {
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == next {
            return false;
        }
        *state = next;
        true
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let viewers = *self.viewer_count.lock().unwrap_or_else(|e| e.into_inner());
        SessionSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            task_id: self.task_id.clone(),
            agent_type: self.agent_type.clone(),
            role: self.role.clone(),
            state: self.state(),
            human_attached: viewers > 0,
            attached_viewer_count: viewers,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at(),
        }
    }

    /// Parsed segments, most recent `n`.
    pub fn parsed_output(&self, n: usize) -> Vec<OutputLine> {
        self.parsed.last(n)
    }

    /// Parsed segments strictly newer than `ts`.
    pub fn parsed_since(&self, ts: DateTime<Utc>) -> Vec<OutputLine> {
        self.parsed.since(ts)
    }

    pub fn command(&self, id: &Uuid) -> Option<CommandRecord> {
        self.queue.get(id)
    }

    pub fn commands(&self, limit: usize) -> Vec<CommandRecord> {
        self.queue.list(limit)
    }

    fn under_takeover(&self) -> bool {
        self.state() == SessionState::HumanTakeover
    }
}

/// Errors surfaced by `enqueue_command`.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("invalid command payload: {0}")]
    InvalidPayload(String),

    #[error("terminal error: {0}")]
    Terminal(String),
}

/// The session runtime.
pub struct SessionManager {
    backend: Arc<dyn TerminalBackend>,
    bus: Arc<EventBus>,
    sessions: DashMap<String, Arc<ManagedSession>>,
    pause_hooks: Mutex<Vec<PauseHook>>,
    ready_probe: Mutex<Option<ReadyProbe>>,
    /// Self-handle for the pump and monitor tasks.
    me: std::sync::Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn TerminalBackend>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            backend,
            bus,
            sessions: DashMap::new(),
            pause_hooks: Mutex::new(Vec::new()),
            ready_probe: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    /// Register a hook fired when takeover pauses or resumes a session.
    pub fn on_pause_change(&self, hook: PauseHook) {
        self.pause_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Install the ready-for-review probe run by the idle monitor.
    pub fn set_ready_probe(&self, probe: ReadyProbe) {
        *self.ready_probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    /// Spawn an agent session. On any failure after the terminal spawns,
    /// the terminal is destroyed again: no orphan fd, no orphan entry.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<Arc<ManagedSession>> {
        let argv = shell_argv(&spec.command);
        if argv.is_empty() {
            bail!("empty agent command");
        }
        let readiness_pattern = spec
            .readiness_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid readiness pattern")?;

        let id = Uuid::new_v4().to_string();
        let name = self.unique_name(&spec.name);

        let mut spawn = SpawnSpec::new(id.clone(), argv);
        spawn.name = name.clone();
        spawn.work_dir = spec.work_dir.clone();
        spawn.env = spec.env.clone();
        spawn.size = spec.size;
        self.backend.create_session(spawn).await?;

        let events = match self.backend.take_events(&id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.backend.destroy_session(&id).await;
                return Err(e).context("terminal event stream unavailable");
            }
        };

        let now = Utc::now();
        let session = Arc::new(ManagedSession {
            id: id.clone(),
            name,
            task_id: spec.task_id,
            agent_type: spec.agent_type,
            role: spec.role,
            work_dir: spec.work_dir,
            created_at: now,
            state: RwLock::new(SessionState::Starting),
            resume_state: Mutex::new(SessionState::Starting),
            viewer_count: Mutex::new(0),
            last_activity: RwLock::new(now),
            parser: Mutex::new(OutputParser::new(id.clone())),
            parsed: ParsedRing::new(PARSED_RING_DEPTH),
            queue: CommandQueue::new(id.clone()),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            readiness_pattern,
            completion_signaled: AtomicBool::new(false),
            destroy_requested: AtomicBool::new(false),
        });

        self.sessions.insert(id.clone(), Arc::clone(&session));
        self.spawn_output_pump(Arc::clone(&session), events);
        self.spawn_monitor(Arc::clone(&session));
        self.publish_windows();
        info!(session = %id, agent = %session.agent_type, role = %session.role, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ManagedSession>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Sessions currently holding a live terminal (counts toward caps;
    /// takeover included).
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    /// Raw ring-buffer capture for a session.
    pub async fn capture_raw(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        Ok(self.backend.capture_output(id, lines).await?)
    }

    /// Enqueue a command for a session.
    ///
    /// `send_text` passes the command policy first; `resize` bypasses the
    /// queue entirely and is recorded as immediately completed.
    pub async fn enqueue_command(
        &self,
        session_id: &str,
        op: CommandOp,
        payload: Value,
    ) -> std::result::Result<Uuid, EnqueueError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| EnqueueError::UnknownSession(session_id.to_string()))?;

        match op {
            CommandOp::SendText => {
                let text = payload
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EnqueueError::InvalidPayload("missing text".into()))?;
                CommandPolicy::check(text, session.work_dir.as_deref())?;
            }
            CommandOp::Resize => {
                let cols = payload.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
                let rows = payload.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;
                self.backend
                    .resize(session_id, cols, rows)
                    .await
                    .map_err(|e| EnqueueError::Terminal(e.to_string()))?;
                return Ok(session.queue.record_immediate(op, payload, "resized"));
            }
            _ => {}
        }

        let id = session.queue.enqueue(op, payload);
        self.pump_queue(&session).await;
        Ok(id)
    }

    /// Adjust the attached-viewer count. `0 → 1` pauses automation and
    /// enters takeover; `1 → 0` resumes; intermediate deltas only change
    /// the count.
    pub fn set_takeover(&self, session_id: &str, delta: i64) -> Result<SessionSnapshot> {
        let session = self
            .get(session_id)
            .with_context(|| format!("unknown session: {}", session_id))?;

        let (entered, exited) = {
            let mut count = session
                .viewer_count
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let before = *count;
            let after = (before as i64 + delta).max(0) as usize;
            *count = after;
            (before == 0 && after > 0, before > 0 && after == 0)
        };

        if entered && !session.state().is_terminal() {
            let prev = session.state();
            *session
                .resume_state
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = prev;
            session.set_state(SessionState::HumanTakeover);
            self.fire_pause_hooks(session_id, true);
            self.publish_windows();
            info!(session = %session_id, "human takeover: automation paused");
        } else if exited && session.state() == SessionState::HumanTakeover {
            let saved = *session
                .resume_state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            // Review-wait survives the takeover; activity states are
            // recomputed from live output instead of the stale snapshot.
            let next = if saved == SessionState::WaitingReview {
                saved
            } else {
                let activity = {
                    let parser = session.parser.lock().unwrap_or_else(|e| e.into_inner());
                    parser.status(Utc::now())
                };
                match activity {
                    SessionActivity::Waiting => SessionState::Waiting,
                    SessionActivity::Idle => SessionState::Idle,
                    SessionActivity::Disconnected => SessionState::Disconnected,
                    SessionActivity::Working => SessionState::Working,
                }
            };
            session.set_state(next);
            self.fire_pause_hooks(session_id, false);
            self.publish_windows();
            info!(session = %session_id, "human takeover ended: automation resumed");
        }

        Ok(session.snapshot())
    }

    /// Raw terminal input from an attached viewer. Bypasses the command
    /// queue and the policy: the human is typing directly.
    pub async fn write_raw(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        self.get(session_id)
            .with_context(|| format!("unknown session: {}", session_id))?;
        self.backend.write(session_id, bytes).await?;
        Ok(())
    }

    /// Resize a session's terminal window.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.backend.resize(session_id, cols, rows).await?;
        Ok(())
    }

    /// Destroy every live session; used at daemon shutdown.
    pub async fn shutdown(&self) {
        for snapshot in self.list() {
            if let Err(e) = self.destroy_session(&snapshot.id).await {
                warn!(session = %snapshot.id, "shutdown destroy failed: {}", e);
            }
        }
    }

    /// Signal the session's process and mark the intent so the close is
    /// recorded as completion rather than failure.
    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.get(session_id) else {
            return Ok(());
        };
        session.destroy_requested.store(true, Ordering::SeqCst);
        self.backend.destroy_session(session_id).await?;
        Ok(())
    }

    /// Wait until the readiness gate opens, or time out.
    pub async fn wait_ready(&self, session_id: &str, timeout: Duration) -> Result<bool> {
        let session = self
            .get(session_id)
            .with_context(|| format!("unknown session: {}", session_id))?;
        if session.is_ready() {
            return Ok(true);
        }
        let waited = tokio::time::timeout(timeout, session.ready_notify.notified()).await;
        Ok(waited.is_ok() || session.is_ready())
    }

    fn unique_name(&self, requested: &str) -> String {
        let base = if requested.is_empty() { "agent" } else { requested };
        let in_use = |name: &str| {
            self.sessions
                .iter()
                .any(|e| e.value().name == name && !e.value().state().is_terminal())
        };
        if !in_use(base) {
            return base.to_string();
        }
        for i in 2..=(NAME_RETRIES + 1) {
            let candidate = format!("{}-{}", base, i);
            if !in_use(&candidate) {
                return candidate;
            }
        }
        let suffix: u32 = rand::rng().random();
        format!("{}-{:08x}", base, suffix)
    }

    fn fire_pause_hooks(&self, session_id: &str, paused: bool) {
        let hooks: Vec<PauseHook> = self
            .pause_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(session_id, paused);
        }
    }

    fn publish_windows(&self) {
        let list: Vec<WindowInfo> = self
            .sessions
            .iter()
            .map(|e| {
                let s = e.value();
                WindowInfo {
                    id: s.id.clone(),
                    session_id: s.id.clone(),
                    name: s.name.clone(),
                    status: s.state().activity(),
                }
            })
            .collect();
        self.bus.update_windows(list);
    }

    async fn pump_queue(&self, session: &Arc<ManagedSession>) {
        if !session.is_ready() || session.state().is_terminal() {
            return;
        }
        let Some(dispatch) = session.queue.next_to_send(Utc::now()) else {
            return;
        };
        if let Err(e) = self.transmit(session, &dispatch).await {
            warn!(session = %session.id, command = %dispatch.id, "command write failed: {}", e);
            session.queue.fail_in_flight(&e.to_string(), Utc::now());
        } else if !session.under_takeover() {
            if session.set_state(SessionState::Working) {
                self.bus
                    .publish_status(&session.id, SessionActivity::Working);
                self.publish_windows();
            }
        }
    }

    async fn transmit(&self, session: &Arc<ManagedSession>, dispatch: &Dispatch) -> Result<()> {
        match dispatch.op {
            CommandOp::SendText => {
                let text = dispatch
                    .payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.backend.write(&session.id, text.as_bytes()).await?;
            }
            CommandOp::SendKey => {
                let key = dispatch
                    .payload
                    .get("key")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match NamedKey::parse(key) {
                    Some(named) => self.backend.send_key(&session.id, named).await?,
                    // Unknown names pass through as literal text.
                    None => self.backend.write(&session.id, key.as_bytes()).await?,
                }
            }
            CommandOp::Interrupt => {
                self.backend
                    .send_key(&session.id, NamedKey::CtrlC)
                    .await?;
            }
            CommandOp::Close => {
                session.destroy_requested.store(true, Ordering::SeqCst);
                self.backend.destroy_session(&session.id).await?;
            }
            CommandOp::Resize => {}
        }
        Ok(())
    }

    fn spawn_output_pump(
        &self,
        session: Arc<ManagedSession>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TerminalEvent>,
    ) {
        let Some(manager) = self.handle() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TerminalEvent::Output(bytes) => {
                        let now = Utc::now();
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        *session
                            .last_activity
                            .write()
                            .unwrap_or_else(|e| e.into_inner()) = now;
                        session.queue.on_output(now);

                        manager.bus.publish(BusEvent::TerminalData {
                            session_id: session.id.clone(),
                            text: text.clone(),
                        });

                        let msgs = {
                            let mut parser =
                                session.parser.lock().unwrap_or_else(|e| e.into_inner());
                            parser.feed(&text, now)
                        };
                        for msg in msgs {
                            manager.handle_segment(&session, msg).await;
                        }
                        manager.reconcile_state(&session);
                    }
                    TerminalEvent::Closed => {
                        manager.handle_closed(&session).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_segment(&self, session: &Arc<ManagedSession>, msg: ParsedMessage) {
        let now = Utc::now();
        session
            .parsed
            .push(&session.id, msg.text.clone(), msg.class, msg.timestamp);
        session.queue.on_segment(&msg, now);

        if !session.is_ready() {
            let pattern_hit = session
                .readiness_pattern
                .as_ref()
                .is_some_and(|re| re.is_match(&msg.text));
            let class_hit = matches!(msg.class, MessageClass::Normal | MessageClass::Prompt);
            if pattern_hit || class_hit {
                session.ready.store(true, Ordering::SeqCst);
                session.ready_notify.notify_waiters();
                debug!(session = %session.id, "readiness gate open");
            }
        }

        self.bus.publish_output(msg);
        self.pump_queue(session).await;
    }

    async fn handle_closed(&self, session: &Arc<ManagedSession>) {
        let now = Utc::now();
        let tail = {
            let mut parser = session.parser.lock().unwrap_or_else(|e| e.into_inner());
            parser.mark_closed(now)
        };
        if let Some(msg) = tail {
            session
                .parsed
                .push(&session.id, msg.text.clone(), msg.class, msg.timestamp);
            self.bus.publish_output(msg);
        }
        session.queue.fail_in_flight("session closed", now);
        session.queue.discard_queued(now);

        // Abrupt termination without a completion signal is a failure,
        // never a silent completion.
        let completed = session.completion_signaled.load(Ordering::SeqCst)
            || session.destroy_requested.load(Ordering::SeqCst);
        let final_state = if session.state() == SessionState::Completed {
            SessionState::Completed
        } else if completed {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        session.set_state(final_state);
        self.bus
            .publish_status(&session.id, SessionActivity::Disconnected);
        self.publish_windows();
        info!(session = %session.id, state = ?final_state, "session closed");
    }

    /// Map parser activity onto the session state, leaving takeover,
    /// review-wait, and terminal states alone.
    fn reconcile_state(&self, session: &Arc<ManagedSession>) {
        let current = session.state();
        if current.is_terminal()
            || matches!(
                current,
                SessionState::HumanTakeover | SessionState::WaitingReview | SessionState::Starting
            )
        {
            return;
        }
        let activity = {
            let parser = session.parser.lock().unwrap_or_else(|e| e.into_inner());
            parser.status(Utc::now())
        };
        let next = match activity {
            SessionActivity::Waiting => SessionState::Waiting,
            SessionActivity::Idle => SessionState::Idle,
            SessionActivity::Working => SessionState::Working,
            SessionActivity::Disconnected => return,
        };
        if session.set_state(next) {
            self.bus.publish_status(&session.id, activity);
            self.publish_windows();
        }
    }

    fn spawn_monitor(&self, session: Arc<ManagedSession>) {
        let Some(manager) = self.handle() else {
            return;
        };
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if session.state().is_terminal() {
                    break;
                }
                let now = Utc::now();

                let stale = {
                    let mut parser = session.parser.lock().unwrap_or_else(|e| e.into_inner());
                    parser.flush_stale(now)
                };
                if let Some(msg) = stale {
                    manager.handle_segment(&session, msg).await;
                }

                for id in session.queue.tick(now) {
                    warn!(session = %session.id, command = %id, "command timed out");
                }
                manager.pump_queue(&session).await;

                if !session.under_takeover() {
                    if let Some(dir) = &session.work_dir {
                        if dir.join(DONE_MARKER).exists() {
                            session.completion_signaled.store(true, Ordering::SeqCst);
                            if session.set_state(SessionState::Completed) {
                                info!(session = %session.id, "completion marker found");
                                let _ = manager.backend.destroy_session(&session.id).await;
                            }
                            continue;
                        }
                        let probe = manager
                            .ready_probe
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        if let Some(probe) = probe {
                            if session.state() != SessionState::WaitingReview && probe(dir) {
                                session.completion_signaled.store(true, Ordering::SeqCst);
                                if session.set_state(SessionState::WaitingReview) {
                                    manager.publish_session_status(&session);
                                }
                            }
                        }
                    }
                    manager.reconcile_state(&session);
                }
            }
        });
    }

    fn publish_session_status(&self, session: &Arc<ManagedSession>) {
        self.bus
            .publish_status(&session.id, session.state().activity());
        self.publish_windows();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PtyBackend;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Arc::new(PtyBackend::new()), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn takeover_refcount_pauses_once_and_resumes_once() {
        let mgr = manager();
        let session = mgr
            .create_session(SessionSpec::new("takeover-test", "cat"))
            .await
            .unwrap();

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        mgr.on_pause_change(Arc::new(move |_, paused| {
            seen.lock().unwrap().push(paused);
        }));

        // Two viewers attach, then detach one at a time.
        mgr.set_takeover(&session.id, 1).unwrap();
        let snap = mgr.set_takeover(&session.id, 1).unwrap();
        assert!(snap.human_attached);
        assert_eq!(snap.attached_viewer_count, 2);
        assert_eq!(session.state(), SessionState::HumanTakeover);

        let snap = mgr.set_takeover(&session.id, -1).unwrap();
        assert!(snap.human_attached);
        assert_eq!(session.state(), SessionState::HumanTakeover);

        let snap = mgr.set_takeover(&session.id, -1).unwrap();
        assert!(!snap.human_attached);
        assert_ne!(session.state(), SessionState::HumanTakeover);

        // Paused exactly once, resumed exactly once.
        assert_eq!(transitions.lock().unwrap().as_slice(), &[true, false]);

        mgr.destroy_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn viewer_count_never_goes_negative() {
        let mgr = manager();
        let session = mgr
            .create_session(SessionSpec::new("negative-test", "cat"))
            .await
            .unwrap();
        let snap = mgr.set_takeover(&session.id, -1).unwrap();
        assert_eq!(snap.attached_viewer_count, 0);
        assert!(!snap.human_attached);
        mgr.destroy_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn policy_violation_never_reaches_the_queue() {
        let mgr = manager();
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = SessionSpec::new("policy-test", "cat");
        spec.work_dir = Some(tmp.path().to_path_buf());
        let session = mgr.create_session(spec).await.unwrap();

        let err = mgr
            .enqueue_command(
                &session.id,
                CommandOp::SendText,
                serde_json::json!({"text": "rm -rf '/tmp/danger'\n"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Policy(_)));
        assert!(session.commands(10).is_empty());

        mgr.destroy_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn unique_names_get_suffixes() {
        let mgr = manager();
        let a = mgr
            .create_session(SessionSpec::new("dup", "cat"))
            .await
            .unwrap();
        let b = mgr
            .create_session(SessionSpec::new("dup", "cat"))
            .await
            .unwrap();
        assert_eq!(a.name, "dup");
        assert_eq!(b.name, "dup-2");
        mgr.destroy_session(&a.id).await.unwrap();
        mgr.destroy_session(&b.id).await.unwrap();
    }

    #[tokio::test]
    async fn create_failure_leaves_no_orphan_entry() {
        let mgr = manager();
        let result = mgr
            .create_session(SessionSpec::new("broken", ""))
            .await;
        assert!(result.is_err());
        assert!(mgr.list().is_empty());
    }
}
