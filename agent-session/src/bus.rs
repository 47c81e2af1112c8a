//! Typed event fan-out.
//!
//! The bus delivers terminal data, parsed output, status changes, window
//! snapshots, and project events to any number of subscribers. Each
//! subscriber owns a bounded queue; when it fills, the oldest message is
//! dropped so emitters never block. Lock discipline: subscriber references
//! are copied under the map lock, queue pushes happen outside it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::parser::{ParsedMessage, SessionActivity};

/// Default bound on each subscriber's outbound queue.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;
/// Output messages for one session within this window are coalesced.
pub const OUTPUT_COALESCE_MS: i64 = 100;

/// One entry in the session list snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub status: SessionActivity,
}

/// Events carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Raw terminal bytes for live rendering.
    TerminalData { session_id: String, text: String },
    /// Parsed output segments. Batched, never split across a segment.
    Output {
        session_id: String,
        messages: Vec<ParsedMessage>,
    },
    /// Session status change.
    Status {
        session_id: String,
        status: SessionActivity,
    },
    /// Session list snapshot; every subscriber's first message.
    Windows { list: Vec<WindowInfo> },
    /// Project-level milestone.
    ProjectEvent {
        project_id: String,
        event: String,
        data: Value,
        ts: i64,
    },
}

impl BusEvent {
    fn session_id(&self) -> Option<&str> {
        match self {
            BusEvent::TerminalData { session_id, .. }
            | BusEvent::Output { session_id, .. }
            | BusEvent::Status { session_id, .. } => Some(session_id),
            BusEvent::Windows { .. } | BusEvent::ProjectEvent { .. } => None,
        }
    }
}

struct SubscriberInner {
    /// `None` subscribes to everything.
    filter: Mutex<Option<HashSet<String>>>,
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SubscriberInner {
    fn matches(&self, event: &BusEvent) -> bool {
        match event.session_id() {
            None => true,
            Some(sid) => {
                let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
                match filter.as_ref() {
                    None => true,
                    Some(set) => set.contains(sid),
                }
            }
        }
    }

    fn push(&self, event: BusEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

        // Coalesce bursts of parsed output for the same session. Segments
        // are appended whole, never split.
        if let BusEvent::Output {
            session_id,
            messages,
        } = &event
        {
            if let Some(BusEvent::Output {
                session_id: last_sid,
                messages: last_msgs,
            }) = queue.back_mut()
            {
                if last_sid == session_id {
                    let close_enough = match (last_msgs.last(), messages.first()) {
                        (Some(prev), Some(next)) => {
                            next.timestamp - prev.timestamp
                                <= chrono::Duration::milliseconds(OUTPUT_COALESCE_MS)
                        }
                        _ => false,
                    };
                    if close_enough {
                        last_msgs.extend(messages.iter().cloned());
                        self.notify.notify_one();
                        return;
                    }
                }
            }
        }

        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
        self.notify.notify_one();
    }
}

/// Receiving half handed to a subscriber.
pub struct Subscriber {
    pub id: Uuid,
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Wait for the next event. Returns `None` once unsubscribed and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking pop, for polling consumers and tests.
    pub fn try_recv(&self) -> Option<BusEvent> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Narrow this subscription to a session (adds to the filter set).
    pub fn subscribe_session(&self, session_id: &str) {
        let mut filter = self.inner.filter.lock().unwrap_or_else(|e| e.into_inner());
        filter
            .get_or_insert_with(HashSet::new)
            .insert(session_id.to_string());
    }

    /// Remove a session from the filter set.
    pub fn unsubscribe_session(&self, session_id: &str) {
        let mut filter = self.inner.filter.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = filter.as_mut() {
            set.remove(session_id);
        }
    }
}

/// The fan-out hub.
pub struct EventBus {
    subscribers: RwLock<HashMap<Uuid, Arc<SubscriberInner>>>,
    windows: Mutex<Vec<WindowInfo>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_depth(SUBSCRIBER_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            windows: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Register a subscriber. `filter` of `None` receives every event.
    ///
    /// The current `windows` snapshot is enqueued first, even when empty,
    /// so clients always start from a session list.
    pub fn subscribe(&self, filter: Option<HashSet<String>>) -> Subscriber {
        let inner = Arc::new(SubscriberInner {
            filter: Mutex::new(filter),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });

        let snapshot = self
            .windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        inner.push(BusEvent::Windows { list: snapshot });

        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&inner));
        Subscriber { id, inner }
    }

    /// Remove a subscriber. Never blocks, regardless of consumer state.
    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(inner) = removed {
            inner.closed.store(true, Ordering::SeqCst);
            inner.notify.notify_waiters();
        }
    }

    /// Publish an event to all matching subscribers without blocking.
    pub fn publish(&self, event: BusEvent) {
        if let BusEvent::Windows { list } = &event {
            *self.windows.lock().unwrap_or_else(|e| e.into_inner()) = list.clone();
        }

        let targets: Vec<Arc<SubscriberInner>> = {
            let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subs.values().cloned().collect()
        };
        for sub in targets {
            if sub.matches(&event) {
                sub.push(event.clone());
            }
        }
    }

    /// Publish one parsed segment as an output batch.
    pub fn publish_output(&self, message: ParsedMessage) {
        let session_id = message.session_id.clone();
        self.publish(BusEvent::Output {
            session_id,
            messages: vec![message],
        });
    }

    pub fn publish_status(&self, session_id: &str, status: SessionActivity) {
        self.publish(BusEvent::Status {
            session_id: session_id.to_string(),
            status,
        });
    }

    pub fn publish_project_event(&self, project_id: &str, event: &str, data: Value) {
        self.publish(BusEvent::ProjectEvent {
            project_id: project_id.to_string(),
            event: event.to_string(),
            data,
            ts: Utc::now().timestamp(),
        });
    }

    /// Replace and broadcast the session list snapshot.
    pub fn update_windows(&self, list: Vec<WindowInfo>) {
        self.publish(BusEvent::Windows { list });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MessageClass;

    fn out_msg(session: &str, text: &str, ts: DateTime<Utc>) -> ParsedMessage {
        ParsedMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session.to_string(),
            text: text.to_string(),
            class: MessageClass::Normal,
            actions: Vec::new(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn first_message_is_windows_snapshot_even_when_empty() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        match sub.recv().await {
            Some(BusEvent::Windows { list }) => assert!(list.is_empty()),
            other => panic!("expected windows snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn filtered_subscriber_only_sees_its_session() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Some(["s1".to_string()].into_iter().collect()));
        let _ = sub.recv().await; // windows handshake

        bus.publish_status("s2", SessionActivity::Working);
        bus.publish_status("s1", SessionActivity::Waiting);

        match sub.recv().await {
            Some(BusEvent::Status { session_id, status }) => {
                assert_eq!(session_id, "s1");
                assert_eq!(status, SessionActivity::Waiting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let bus = EventBus::with_queue_depth(2);
        let sub = bus.subscribe(None);
        let _ = sub.recv().await; // windows handshake

        bus.publish_status("s1", SessionActivity::Working);
        bus.publish_status("s1", SessionActivity::Waiting);
        bus.publish_status("s1", SessionActivity::Idle);

        // Oldest (Working) was dropped.
        match sub.recv().await {
            Some(BusEvent::Status { status, .. }) => {
                assert_eq!(status, SessionActivity::Waiting)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rapid_output_is_coalesced_per_session() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        let _ = sub.recv().await; // windows handshake

        let t = Utc::now();
        bus.publish_output(out_msg("s1", "chunk one", t));
        bus.publish_output(out_msg("s1", "chunk two", t + chrono::Duration::milliseconds(40)));
        // Outside the window: separate event.
        bus.publish_output(out_msg("s1", "later", t + chrono::Duration::milliseconds(400)));

        match sub.recv().await {
            Some(BusEvent::Output { messages, .. }) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].text, "chunk one");
                assert_eq!(messages[1].text, "chunk two");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match sub.recv().await {
            Some(BusEvent::Output { messages, .. }) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].text, "later");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reapplying_same_seq_is_idempotent_for_keyed_consumers() {
        // Subscribers keyed on (session_id, seq) can drop replays; the bus
        // itself just guarantees order per publisher.
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        let _ = sub.recv().await;

        let t = Utc::now();
        bus.publish_output(out_msg("s1", "only once", t));
        let first = sub.try_recv();
        assert!(first.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_wakes_pending_recv() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(None);
        let _ = sub.recv().await;

        let id = sub.id;
        let bus2 = Arc::clone(&bus);
        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus2.unsubscribe(id);
        let got = waiter.await.unwrap();
        assert!(got.is_none());
    }
}
