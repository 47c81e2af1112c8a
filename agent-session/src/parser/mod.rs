//! Output parsing and classification.
//!
//! Raw terminal bytes are segmented into chat-style messages and classified
//! as prompt, error, code, or normal text. The parser also infers the
//! session's activity status from output timing and the last emitted class.

pub mod ansi;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use ansi::strip_ansi;

/// A buffered segment is flushed after this much silence.
pub const SILENCE_FLUSH: std::time::Duration = std::time::Duration::from_millis(1500);
/// Hard ceiling on a buffered segment.
pub const SEGMENT_CEILING: usize = 16 * 1024;
/// Output within this window means the session is working.
pub const WORKING_WINDOW_SECS: i64 = 3;
/// No output for this long (and no pending prompt) means idle.
pub const IDLE_AFTER_SECS: i64 = 30;

static SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[$>%❯]\s*$").unwrap());
static CONFIRM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[Y/n\]|\[y/N\]|Do you want|Are you sure").unwrap());
static NUMERIC_CHOICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[1-([2-9])\]").unwrap());
// Line-anchored error tokens only. A bare `failed` in prose is not an error.
static ERROR_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(^error:|^panic:|^FAILED\b|\bfailed to\b|Traceback)").unwrap()
});
static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```").unwrap());

/// Classification of a parsed output segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    Normal,
    Prompt,
    Error,
    Code,
    System,
}

/// A suggested response to an interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAction {
    pub label: String,
    /// Bytes to send to the terminal when chosen.
    pub keys: String,
}

/// One classified segment of session output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub id: String,
    pub session_id: String,
    pub text: String,
    pub class: MessageClass,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<PromptAction>,
    pub timestamp: DateTime<Utc>,
}

impl ParsedMessage {
    /// A system-injected message (conflict notifications and the like);
    /// never produced by classification.
    pub fn system(session_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            text: text.into(),
            class: MessageClass::System,
            actions: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Last-observed session activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    Working,
    Waiting,
    Idle,
    Disconnected,
}

/// Classify a segment and synthesize prompt actions where applicable.
pub fn classify(text: &str) -> (MessageClass, Vec<PromptAction>) {
    if let Some(caps) = NUMERIC_CHOICE.captures(text) {
        let max: u32 = caps[1].parse().unwrap_or(2);
        let mut actions: Vec<PromptAction> = (1..=max)
            .map(|n| PromptAction {
                label: n.to_string(),
                keys: format!("{}\n", n),
            })
            .collect();
        actions.push(PromptAction {
            label: "Cancel".to_string(),
            keys: "\x03".to_string(),
        });
        return (MessageClass::Prompt, actions);
    }
    if CONFIRM.is_match(text) {
        let actions = vec![
            PromptAction {
                label: "Yes".to_string(),
                keys: "y\n".to_string(),
            },
            PromptAction {
                label: "No".to_string(),
                keys: "n\n".to_string(),
            },
            PromptAction {
                label: "Cancel".to_string(),
                keys: "\x03".to_string(),
            },
        ];
        return (MessageClass::Prompt, actions);
    }
    if ERROR_TOKENS.is_match(text) {
        return (MessageClass::Error, Vec::new());
    }
    if is_code(text) {
        return (MessageClass::Code, Vec::new());
    }
    (MessageClass::Normal, Vec::new())
}

fn is_code(text: &str) -> bool {
    if FENCE.is_match(text) {
        return true;
    }
    let mut run = 0;
    for line in text.lines() {
        let indented = line.starts_with('\t') || line.starts_with("    ");
        if indented && !line.trim().is_empty() {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else if !line.trim().is_empty() {
            run = 0;
        }
    }
    false
}

/// Does this segment end at a shell prompt?
pub fn ends_at_shell_prompt(text: &str) -> bool {
    SHELL_PROMPT.is_match(text.trim_end_matches(['\n']))
}

/// Streaming per-session parser.
///
/// `feed` ingests stripped text and returns any segments the flush policy
/// releases; `flush_stale` is driven by the session monitor tick and handles
/// the silence timeout.
pub struct OutputParser {
    session_id: String,
    buf: String,
    last_feed_at: Option<DateTime<Utc>>,
    last_output_at: Option<DateTime<Utc>>,
    last_class: Option<MessageClass>,
    closed: bool,
}

impl OutputParser {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buf: String::new(),
            last_feed_at: None,
            last_output_at: None,
            last_class: None,
            closed: false,
        }
    }

    /// Ingest raw terminal text. ANSI sequences are stripped before
    /// buffering; returned messages follow the flush policy.
    pub fn feed(&mut self, raw: &str, now: DateTime<Utc>) -> Vec<ParsedMessage> {
        let text = strip_ansi(raw);
        self.last_output_at = Some(now);
        if text.is_empty() {
            return Vec::new();
        }
        self.buf.push_str(&text);
        self.last_feed_at = Some(now);

        let mut out = Vec::new();
        let flush_now = self.buf.len() >= SEGMENT_CEILING
            || CONFIRM.is_match(&self.buf)
            || NUMERIC_CHOICE.is_match(&self.buf)
            || ends_at_shell_prompt(&self.buf);
        if flush_now {
            if let Some(msg) = self.flush(now) {
                out.push(msg);
            }
        }
        out
    }

    /// Flush the buffered segment if the silence timeout has elapsed.
    pub fn flush_stale(&mut self, now: DateTime<Utc>) -> Option<ParsedMessage> {
        let last = self.last_feed_at?;
        let silence = Duration::from_std(SILENCE_FLUSH).unwrap_or_else(|_| Duration::zero());
        if now - last >= silence {
            self.flush(now)
        } else {
            None
        }
    }

    /// Flush any remaining buffered text and mark the stream closed.
    pub fn mark_closed(&mut self, now: DateTime<Utc>) -> Option<ParsedMessage> {
        self.closed = true;
        self.flush(now)
    }

    fn flush(&mut self, now: DateTime<Utc>) -> Option<ParsedMessage> {
        let text = std::mem::take(&mut self.buf);
        self.last_feed_at = None;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (class, actions) = classify(&text);
        self.last_class = Some(class);
        Some(ParsedMessage {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            text,
            class,
            actions,
            timestamp: now,
        })
    }

    /// Infer session activity from output timing and the last emitted class.
    ///
    /// The 3–30 s window deliberately stays `working`: slow model generation
    /// must not read as idle.
    pub fn status(&self, now: DateTime<Utc>) -> SessionActivity {
        if self.closed {
            return SessionActivity::Disconnected;
        }
        if self.last_class == Some(MessageClass::Prompt) {
            return SessionActivity::Waiting;
        }
        match self.last_output_at {
            Some(at) if (now - at) >= Duration::seconds(IDLE_AFTER_SECS) => SessionActivity::Idle,
            Some(_) => SessionActivity::Working,
            None => SessionActivity::Working,
        }
    }

    /// Timestamp of the most recent raw output.
    pub fn last_output_at(&self) -> Option<DateTime<Utc>> {
        self.last_output_at
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
