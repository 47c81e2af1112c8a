//! Event gateway: the seam between the external WebSocket facade and the
//! core.
//!
//! The facade owns sockets and authentication; this module owns the
//! semantics. One [`ClientHandle`] per connected browser client: it holds
//! the bus subscription, tracks which session the viewer is attached to,
//! and routes client messages (subscribe/unsubscribe, terminal input,
//! resize) into the runtime. Dropping the handle detaches the viewer and
//! releases the subscription, so a vanished socket can never leak a
//! takeover.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::protocol::{ClientMessage, ServerMessage};
use agent_session::{EventBus, SessionManager, Subscriber};

/// Connection-scoped bridge between one client and the core.
pub struct ClientHandle {
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    subscriber: Subscriber,
    /// Sessions this client is viewing interactively (takeover refs held).
    attached: HashSet<String>,
}

impl ClientHandle {
    /// Register a new client. Its first received event is always the
    /// `windows` snapshot, even before any session exists.
    pub fn connect(sessions: Arc<SessionManager>, bus: Arc<EventBus>) -> Self {
        let subscriber = bus.subscribe(None);
        Self {
            sessions,
            bus,
            subscriber,
            attached: HashSet::new(),
        }
    }

    /// Wait for the next wire messages for this client.
    pub async fn next_messages(&self) -> Option<Vec<ServerMessage>> {
        let event = self.subscriber.recv().await?;
        let sessions = Arc::clone(&self.sessions);
        Some(ServerMessage::from_bus(event, move |session_id| {
            sessions
                .get(session_id)
                .map(|s| s.name.clone())
                .unwrap_or_default()
        }))
    }

    /// Apply one client message.
    pub async fn handle(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        match message {
            ClientMessage::Subscribe { session_id } => {
                if let Some(id) = session_id {
                    self.subscriber.subscribe_session(&id);
                }
                None
            }
            ClientMessage::Unsubscribe { session_id } => {
                self.subscriber.unsubscribe_session(&session_id);
                None
            }
            ClientMessage::TerminalInput { session_id, text } => {
                // First keystroke attaches the viewer and pauses
                // automation for the session.
                if self.attached.insert(session_id.clone()) {
                    if let Err(e) = self.sessions.set_takeover(&session_id, 1) {
                        self.attached.remove(&session_id);
                        return Some(ServerMessage::Error {
                            message: e.to_string(),
                        });
                    }
                }
                match self.sessions.write_raw(&session_id, text.as_bytes()).await {
                    Ok(()) => None,
                    Err(e) => Some(ServerMessage::Error {
                        message: e.to_string(),
                    }),
                }
            }
            ClientMessage::TerminalResize {
                session_id,
                cols,
                rows,
            } => match self.sessions.resize(&session_id, cols, rows).await {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::Error {
                    message: e.to_string(),
                }),
            },
        }
    }

    /// Detach from a session the client was typing into.
    pub fn detach(&mut self, session_id: &str) {
        if self.attached.remove(session_id) {
            if let Err(e) = self.sessions.set_takeover(session_id, -1) {
                warn!(session = %session_id, "detach failed: {}", e);
            }
        }
    }

    pub fn subscriber_id(&self) -> uuid::Uuid {
        self.subscriber.id
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        // Release every takeover ref this client held, then the
        // subscription. A dropped socket must never keep automation
        // paused.
        let attached: Vec<String> = self.attached.drain().collect();
        for session_id in attached {
            if let Err(e) = self.sessions.set_takeover(&session_id, -1) {
                warn!(session = %session_id, "drop detach failed: {}", e);
            }
        }
        self.bus.unsubscribe(self.subscriber.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_session::{PtyBackend, SessionSpec};

    fn runtime() -> (Arc<SessionManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let sessions = SessionManager::new(Arc::new(PtyBackend::new()), Arc::clone(&bus));
        (sessions, bus)
    }

    #[tokio::test]
    async fn first_messages_are_the_windows_snapshot() {
        let (sessions, bus) = runtime();
        let client = ClientHandle::connect(sessions, bus);
        let messages = client.next_messages().await.unwrap();
        assert!(matches!(messages.as_slice(), [ServerMessage::Windows { .. }]));
    }

    #[tokio::test]
    async fn typing_attaches_and_drop_detaches() {
        let (sessions, bus) = runtime();
        let session = sessions
            .create_session(SessionSpec::new("viewer-test", "cat"))
            .await
            .unwrap();

        let mut client = ClientHandle::connect(Arc::clone(&sessions), bus);
        let err = client
            .handle(ClientMessage::TerminalInput {
                session_id: session.id.clone(),
                text: "ls\n".to_string(),
            })
            .await;
        assert!(err.is_none());
        assert!(
            sessions
                .get(&session.id)
                .unwrap()
                .snapshot()
                .human_attached
        );

        drop(client);
        assert!(
            !sessions
                .get(&session.id)
                .unwrap()
                .snapshot()
                .human_attached,
            "dropping the client must release the takeover"
        );
        sessions.destroy_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn input_to_unknown_session_reports_an_error() {
        let (sessions, bus) = runtime();
        let mut client = ClientHandle::connect(sessions, bus);
        let reply = client
            .handle(ClientMessage::TerminalInput {
                session_id: "missing".to_string(),
                text: "x".to_string(),
            })
            .await;
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));
    }
}
