//! Bounded output buffers.
//!
//! Two rings back each session: a raw byte ring fed by the PTY read pump,
//! and a parsed-line ring holding classified segments with a monotonic
//! sequence number. Both have a single writer and many snapshot readers;
//! readers copy under the lock and consume outside it.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::MessageClass;

/// Fixed-capacity byte ring. Oldest bytes are evicted on overflow.
pub struct OutputRing {
    inner: Mutex<RingInner>,
}

struct RingInner {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
                capacity,
            }),
        }
    }

    /// Append bytes, evicting from the front when over capacity.
    pub fn push(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = inner.capacity;
        if bytes.len() >= capacity {
            inner.buf.clear();
            inner.buf.extend(&bytes[bytes.len() - capacity..]);
            return;
        }
        let overflow = (inner.buf.len() + bytes.len()).saturating_sub(capacity);
        if overflow > 0 {
            inner.buf.drain(..overflow);
        }
        inner.buf.extend(bytes);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.buf.iter().copied().collect()
    }

    /// The most recent `n` lines, split on newline.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let text = String::from_utf8_lossy(&self.snapshot()).into_owned();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].iter().map(|s| s.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One classified output line retained for replay and `since` queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub session_id: String,
    /// Strictly monotonic per session.
    pub seq: u64,
    /// Source timestamp, never the response time.
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub class: MessageClass,
}

/// Bounded deque of parsed output lines with monotonic sequence numbers.
pub struct ParsedRing {
    inner: Mutex<ParsedInner>,
}

struct ParsedInner {
    lines: VecDeque<OutputLine>,
    next_seq: u64,
    capacity: usize,
}

impl ParsedRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ParsedInner {
                lines: VecDeque::new(),
                next_seq: 0,
                capacity,
            }),
        }
    }

    /// Append a segment, assigning the next sequence number.
    pub fn push(
        &self,
        session_id: &str,
        text: String,
        class: MessageClass,
        timestamp: DateTime<Utc>,
    ) -> OutputLine {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let line = OutputLine {
            session_id: session_id.to_string(),
            seq: inner.next_seq,
            timestamp,
            text,
            class,
        };
        inner.next_seq += 1;
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.clone());
        line
    }

    /// The most recent `n` lines in order.
    pub fn last(&self, n: usize) -> Vec<OutputLine> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines strictly newer than `ts`.
    pub fn since(&self, ts: DateTime<Utc>) -> Vec<OutputLine> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .lines
            .iter()
            .filter(|l| l.timestamp > ts)
            .cloned()
            .collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_bytes() {
        let ring = OutputRing::new(8);
        ring.push(b"abcdef");
        ring.push(b"ghij");
        assert_eq!(ring.snapshot(), b"cdefghij");
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let ring = OutputRing::new(4);
        ring.push(b"0123456789");
        assert_eq!(ring.snapshot(), b"6789");
    }

    #[test]
    fn last_lines_returns_tail() {
        let ring = OutputRing::new(1024);
        ring.push(b"one\ntwo\nthree\n");
        assert_eq!(ring.last_lines(2), vec!["two", "three"]);
    }

    #[test]
    fn parsed_ring_seq_is_monotonic() {
        let ring = ParsedRing::new(2);
        let now = Utc::now();
        let a = ring.push("s", "a".into(), MessageClass::Normal, now);
        let b = ring.push("s", "b".into(), MessageClass::Normal, now);
        let c = ring.push("s", "c".into(), MessageClass::Normal, now);
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
        // Eviction does not reset numbering.
        let kept: Vec<u64> = ring.last(10).iter().map(|l| l.seq).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn since_is_strictly_newer() {
        let ring = ParsedRing::new(16);
        let t0 = Utc::now();
        ring.push("s", "old".into(), MessageClass::Normal, t0);
        let t1 = t0 + chrono::Duration::milliseconds(10);
        ring.push("s", "new".into(), MessageClass::Normal, t1);
        let got = ring.since(t0);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "new");
    }
}
