//! Per-session command queue.
//!
//! One command at a time reaches the terminal. Phases advance monotonically
//! through `queued → sent → acked → completed | timeout | failed`; the ack
//! fires on the first output at or after the send timestamp (captured
//! before the write), completion on a quiescent prompt/normal segment or an
//! explicit completion token.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::parser::{MessageClass, ParsedMessage, ends_at_shell_prompt};

/// Default `sent → acked` timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default `acked → completed` timeout.
pub const DEFAULT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);
/// Quiescence a segment must follow to count as command completion.
pub const COMPLETION_QUIESCENCE: Duration = Duration::from_millis(500);
/// Explicit completion token agents commit or print when work is ready.
pub const READY_FOR_REVIEW_TOKEN: &str = "[READY_FOR_REVIEW]";

/// Command operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    SendText,
    SendKey,
    Interrupt,
    Resize,
    Close,
}

/// Command lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPhase {
    Queued,
    Sent,
    Acked,
    Completed,
    Timeout,
    Failed,
}

impl CommandPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandPhase::Completed | CommandPhase::Timeout | CommandPhase::Failed
        )
    }

    /// In-flight phases hold the session's single slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CommandPhase::Sent | CommandPhase::Acked)
    }
}

/// One queued command and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: Uuid,
    pub session_id: String,
    pub op: CommandOp,
    pub payload: Value,
    pub phase: CommandPhase,
    pub enqueued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    /// Per-command completion budget overriding the queue default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_timeout_override: Option<std::time::Duration>,
}

/// A command handed to the sender for transmission.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: Uuid,
    pub op: CommandOp,
    pub payload: Value,
}

/// Per-session queue guaranteeing a single in-flight command.
pub struct CommandQueue {
    session_id: String,
    ack_timeout: Duration,
    complete_timeout: Duration,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    pending: VecDeque<Uuid>,
    in_flight: Option<Uuid>,
    records: HashMap<Uuid, CommandRecord>,
    order: Vec<Uuid>,
    last_raw_output_at: Option<DateTime<Utc>>,
}

impl CommandQueue {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_timeouts(session_id, DEFAULT_ACK_TIMEOUT, DEFAULT_COMPLETE_TIMEOUT)
    }

    pub fn with_timeouts(
        session_id: impl Into<String>,
        ack_timeout: Duration,
        complete_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            ack_timeout,
            complete_timeout,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                in_flight: None,
                records: HashMap::new(),
                order: Vec::new(),
                last_raw_output_at: None,
            }),
        }
    }

    /// Enqueue a command; returns its id.
    pub fn enqueue(&self, op: CommandOp, payload: Value) -> Uuid {
        self.enqueue_with_completion_timeout(op, payload, None)
    }

    /// Enqueue with a per-command completion budget (long builds, short
    /// keystrokes).
    pub fn enqueue_with_completion_timeout(
        &self,
        op: CommandOp,
        payload: Value,
        complete_timeout: Option<Duration>,
    ) -> Uuid {
        let mut inner = self.lock();
        let id = Uuid::new_v4();
        let record = CommandRecord {
            id,
            session_id: self.session_id.clone(),
            op,
            payload,
            phase: CommandPhase::Queued,
            enqueued_at: Utc::now(),
            sent_at: None,
            acked_at: None,
            finished_at: None,
            result: None,
            complete_timeout_override: complete_timeout,
        };
        inner.records.insert(id, record);
        inner.order.push(id);
        inner.pending.push_back(id);
        id
    }

    /// Record an out-of-band command (`resize`) as already completed. The
    /// slot is untouched.
    pub fn record_immediate(&self, op: CommandOp, payload: Value, result: &str) -> Uuid {
        let mut inner = self.lock();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = CommandRecord {
            id,
            session_id: self.session_id.clone(),
            op,
            payload,
            phase: CommandPhase::Completed,
            enqueued_at: now,
            sent_at: Some(now),
            acked_at: Some(now),
            finished_at: Some(now),
            result: Some(result.to_string()),
            complete_timeout_override: None,
        };
        inner.records.insert(id, record);
        inner.order.push(id);
        id
    }

    /// Take the next command for transmission, if the slot is free.
    ///
    /// Marks it `sent` with a timestamp captured before the caller writes,
    /// so the first subsequent output byte counts as the ack.
    pub fn next_to_send(&self, now: DateTime<Utc>) -> Option<Dispatch> {
        let mut inner = self.lock();
        if inner.in_flight.is_some() {
            return None;
        }
        let id = inner.pending.pop_front()?;
        inner.in_flight = Some(id);
        let record = inner.records.get_mut(&id)?;
        record.phase = CommandPhase::Sent;
        record.sent_at = Some(now);
        Some(Dispatch {
            id,
            op: record.op,
            payload: record.payload.clone(),
        })
    }

    /// Record raw output; acks the in-flight command when the output
    /// arrived at or after its send timestamp.
    pub fn on_output(&self, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_raw_output_at = Some(ts);
        let Some(id) = inner.in_flight else {
            return;
        };
        if let Some(record) = inner.records.get_mut(&id) {
            if record.phase == CommandPhase::Sent
                && record.sent_at.is_some_and(|sent| ts >= sent)
            {
                record.phase = CommandPhase::Acked;
                record.acked_at = Some(ts);
            }
        }
    }

    /// Feed a classified segment; completes the in-flight command on an
    /// explicit completion token or a quiescent prompt/normal segment.
    pub fn on_segment(&self, msg: &ParsedMessage, now: DateTime<Utc>) {
        let mut inner = self.lock();
        let Some(id) = inner.in_flight else {
            return;
        };
        let last_raw = inner.last_raw_output_at;
        let Some(record) = inner.records.get_mut(&id) else {
            return;
        };
        if record.phase != CommandPhase::Acked {
            return;
        }

        // A prompt segment means the agent is blocked on input: the slot
        // must free up so the answer can be sent.
        let explicit = msg.text.contains(READY_FOR_REVIEW_TOKEN)
            || ends_at_shell_prompt(&msg.text)
            || msg.class == MessageClass::Prompt;
        let quiescent = msg.class == MessageClass::Normal
            && last_raw.map_or(true, |at| {
                (now - at).to_std().unwrap_or_default() >= COMPLETION_QUIESCENCE
            });

        if explicit || quiescent {
            record.phase = CommandPhase::Completed;
            record.finished_at = Some(now);
            record.result = Some(msg.text.clone());
            inner.in_flight = None;
        }
    }

    /// Drive ack/completion timeouts. Returns ids that timed out.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut inner = self.lock();
        let Some(id) = inner.in_flight else {
            return Vec::new();
        };
        let ack_timeout = self.ack_timeout;
        let complete_timeout = self.complete_timeout;
        let Some(record) = inner.records.get_mut(&id) else {
            return Vec::new();
        };

        let complete_budget = record.complete_timeout_override.unwrap_or(complete_timeout);
        let expired = match record.phase {
            CommandPhase::Sent => record
                .sent_at
                .is_some_and(|at| (now - at).to_std().unwrap_or_default() >= ack_timeout),
            CommandPhase::Acked => record
                .acked_at
                .is_some_and(|at| (now - at).to_std().unwrap_or_default() >= complete_budget),
            _ => false,
        };

        if expired {
            record.phase = CommandPhase::Timeout;
            record.finished_at = Some(now);
            inner.in_flight = None;
            vec![id]
        } else {
            Vec::new()
        }
    }

    /// Fail the in-flight command (write error, session closed).
    pub fn fail_in_flight(&self, reason: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(id) = inner.in_flight.take() {
            if let Some(record) = inner.records.get_mut(&id) {
                record.phase = CommandPhase::Failed;
                record.finished_at = Some(now);
                record.result = Some(reason.to_string());
            }
        }
    }

    /// Discard queued (not yet sent) commands; used on cancellation. The
    /// in-flight command is left to complete or time out.
    pub fn discard_queued(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let drained: Vec<Uuid> = inner.pending.drain(..).collect();
        let count = drained.len();
        for id in drained {
            if let Some(record) = inner.records.get_mut(&id) {
                record.phase = CommandPhase::Failed;
                record.finished_at = Some(now);
                record.result = Some("cancelled".to_string());
            }
        }
        count
    }

    pub fn get(&self, id: &Uuid) -> Option<CommandRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Most recent `limit` commands in enqueue order.
    pub fn list(&self, limit: usize) -> Vec<CommandRecord> {
        let inner = self.lock();
        let skip = inner.order.len().saturating_sub(limit);
        inner
            .order
            .iter()
            .skip(skip)
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Whether a command currently holds the session slot.
    pub fn has_in_flight(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn msg(class: MessageClass, text: &str, ts: DateTime<Utc>) -> ParsedMessage {
        ParsedMessage {
            id: Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            text: text.to_string(),
            class,
            actions: Vec::new(),
            timestamp: ts,
        }
    }

    #[test]
    fn single_in_flight_at_a_time() {
        let q = CommandQueue::new("s1");
        let now = Utc::now();
        let a = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "ls"}));
        let b = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "pwd"}));

        let first = q.next_to_send(now).unwrap();
        assert_eq!(first.id, a);
        // Slot is held: nothing else goes out.
        assert!(q.next_to_send(now).is_none());
        assert_eq!(q.get(&b).unwrap().phase, CommandPhase::Queued);
    }

    #[test]
    fn output_after_send_acks() {
        let q = CommandQueue::new("s1");
        let sent_at = Utc::now();
        let id = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "ls"}));
        q.next_to_send(sent_at);

        // Output from before the send does not ack.
        q.on_output(sent_at - ChronoDuration::milliseconds(50));
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Sent);

        q.on_output(sent_at + ChronoDuration::milliseconds(50));
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Acked);
    }

    #[test]
    fn quiescent_normal_segment_completes() {
        let q = CommandQueue::new("s1");
        let t = Utc::now();
        let id = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "ls"}));
        q.next_to_send(t);
        q.on_output(t + ChronoDuration::milliseconds(10));

        // Segment arriving 600ms after the last raw output counts.
        let seg_at = t + ChronoDuration::milliseconds(610);
        q.on_segment(&msg(MessageClass::Normal, "files listed", seg_at), seg_at);
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Completed);
        assert!(!q.has_in_flight());
    }

    #[test]
    fn busy_segment_does_not_complete_before_quiescence() {
        let q = CommandQueue::new("s1");
        let t = Utc::now();
        let id = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "make"}));
        q.next_to_send(t);
        q.on_output(t + ChronoDuration::milliseconds(400));

        let seg_at = t + ChronoDuration::milliseconds(500);
        q.on_segment(&msg(MessageClass::Normal, "compiling...", seg_at), seg_at);
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Acked);
    }

    #[test]
    fn explicit_token_completes_immediately() {
        let q = CommandQueue::new("s1");
        let t = Utc::now();
        let id = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "work"}));
        q.next_to_send(t);
        q.on_output(t + ChronoDuration::milliseconds(10));

        let seg_at = t + ChronoDuration::milliseconds(20);
        q.on_segment(
            &msg(MessageClass::Normal, "committed [READY_FOR_REVIEW]", seg_at),
            seg_at,
        );
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Completed);
    }

    #[test]
    fn ack_timeout_expires_the_slot() {
        let q = CommandQueue::with_timeouts(
            "s1",
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let t = Utc::now();
        let id = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "ls"}));
        q.next_to_send(t);

        assert!(q.tick(t + ChronoDuration::seconds(4)).is_empty());
        let timed_out = q.tick(t + ChronoDuration::seconds(6));
        assert_eq!(timed_out, vec![id]);
        assert_eq!(q.get(&id).unwrap().phase, CommandPhase::Timeout);
        assert!(!q.has_in_flight());
    }

    #[test]
    fn next_command_goes_out_after_completion() {
        let q = CommandQueue::new("s1");
        let t = Utc::now();
        q.enqueue(CommandOp::SendText, serde_json::json!({"text": "a"}));
        let b = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "b"}));

        q.next_to_send(t);
        q.on_output(t + ChronoDuration::milliseconds(10));
        let seg_at = t + ChronoDuration::milliseconds(700);
        q.on_segment(&msg(MessageClass::Prompt, "done? [Y/n]", seg_at), seg_at);

        let next = q.next_to_send(seg_at).unwrap();
        assert_eq!(next.id, b);
    }

    #[test]
    fn discard_queued_leaves_in_flight() {
        let q = CommandQueue::new("s1");
        let t = Utc::now();
        let a = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "a"}));
        let b = q.enqueue(CommandOp::SendText, serde_json::json!({"text": "b"}));
        q.next_to_send(t);

        assert_eq!(q.discard_queued(t), 1);
        assert_eq!(q.get(&a).unwrap().phase, CommandPhase::Sent);
        assert_eq!(q.get(&b).unwrap().phase, CommandPhase::Failed);
    }
}
